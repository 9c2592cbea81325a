//! # Piece Items
//!
//! The two item kinds that flow through the coordinator's channels.
//!
//! A [`PieceWork`] names a piece to fetch: its index, its expected SHA-1
//! digest, and its exact length (the last piece of a torrent is usually
//! shorter than the rest). Work items are created once when a download
//! starts and travel from worker to worker through the shared queue until
//! some worker verifies them.
//!
//! A [`PieceResult`] carries a verified piece's bytes back to the
//! coordinator, which owns them from then on.

/// A piece waiting to be downloaded and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent.
    pub index: u32,
    /// Expected SHA-1 digest of the piece contents.
    pub hash: [u8; 20],
    /// Exact length of this piece in bytes.
    pub length: u32,
}

impl PieceWork {
    /// Builds a work item.
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

/// A downloaded, hash-verified piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent.
    pub index: u32,
    /// The piece contents, exactly `length` bytes.
    pub data: Vec<u8>,
}

impl PieceResult {
    /// Builds a result item, taking ownership of the piece buffer.
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}
