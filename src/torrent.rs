//! # Torrent Descriptor
//!
//! Projection of a bencoded `.torrent` file into a typed, immutable
//! metainfo record.
//!
//! ## Torrent File Format
//!
//! A torrent file is a bencoded dictionary:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **info**: Dictionary with file information and piece hashes
//!   - **name**: Suggested filename
//!   - **piece length**: Size of each piece in bytes
//!   - **pieces**: Concatenated 20-byte SHA-1 digests, one per piece
//!   - **length** *or* **files**: single-file size, or the multi-file list
//!     of `{length, path}` entries
//!
//! ## Identity
//!
//! The torrent's identity is the SHA-1 of the `info` dictionary exactly as
//! it appeared in the source stream. The codec's raw spans make that
//! possible; hashing a re-encoding would produce a different digest for any
//! source whose keys were not already in canonical order.

use std::path::Path;

use boring::sha::Sha1;
use thiserror::Error;

use crate::bencode::{self, BencodeError, Node};

/// Port advertised to the tracker. The core never listens; seeding is an
/// external concern.
pub const PORT: u16 = 65534;

/// Size of a SHA-1 digest in bytes.
pub const SHA1_HASH_SIZE: usize = 20;

/// Errors produced while projecting a torrent file.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// The file is not valid bencode.
    #[error("malformed bencode: {0}")]
    Bencode(#[from] BencodeError),

    /// The file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The bencode is valid but does not describe a torrent.
    #[error("malformed torrent: {0}")]
    MalformedTorrent(String),

    /// The `pieces` string does not split into whole 20-byte digests.
    #[error("malformed pieces of length {0}")]
    MalformedPieces(usize),
}

/// One entry of a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Size of this file in bytes.
    pub length: u64,
    /// Path components below the torrent's name directory.
    pub path: Vec<String>,
}

/// Metadata of a torrent, derived once from its bencoded form and immutable
/// thereafter.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker URL.
    pub announce: String,
    /// SHA-1 of the raw `info` dictionary bytes.
    pub info_hash: [u8; 20],
    /// One 20-byte SHA-1 digest per piece.
    pub piece_hashes: Vec<[u8; 20]>,
    /// Size of each piece in bytes, except possibly the last.
    pub piece_length: u32,
    /// Total content size in bytes.
    pub length: u64,
    /// Suggested name for the download.
    pub name: String,
    /// File layout; empty in single-file mode.
    pub files: Vec<FileEntry>,
}

impl Torrent {
    /// Reads and projects a `.torrent` file.
    pub fn open(path: impl AsRef<Path>) -> Result<Torrent, TorrentError> {
        let data = std::fs::read(path)?;
        Torrent::from_bytes(&data)
    }

    /// Projects a bencoded torrent document.
    pub fn from_bytes(data: &[u8]) -> Result<Torrent, TorrentError> {
        let root = bencode::decode(data)?;
        if root.as_dict().is_none() {
            return Err(malformed("root is not a dictionary"));
        }

        let announce = root
            .get(b"announce")
            .and_then(Node::as_str)
            .ok_or_else(|| malformed("missing announce"))?
            .to_string();

        let info = root
            .get(b"info")
            .ok_or_else(|| malformed("missing info"))?;
        if info.as_dict().is_none() {
            return Err(malformed("info is not a dictionary"));
        }

        // The identity hash covers the info bytes as they appeared in the
        // source, not a re-encoding.
        let mut hasher = Sha1::new();
        hasher.update(&data[info.span()]);
        let info_hash = hasher.finish();

        let name = info
            .get(b"name")
            .and_then(Node::as_str)
            .ok_or_else(|| malformed("missing name"))?
            .to_string();

        let piece_length = info
            .get(b"piece length")
            .and_then(Node::as_integer)
            .ok_or_else(|| malformed("missing piece length"))?;
        if piece_length <= 0 || piece_length > u32::MAX as i64 {
            return Err(malformed("piece length out of range"));
        }
        let piece_length = piece_length as u32;

        let pieces = info
            .get(b"pieces")
            .and_then(Node::as_bytes)
            .ok_or_else(|| malformed("missing pieces"))?;
        let piece_hashes = split_piece_hashes(pieces)?;

        let (length, files) = read_layout(info)?;

        let torrent = Torrent {
            announce,
            info_hash,
            piece_hashes,
            piece_length,
            length,
            name,
            files,
        };

        let expected = torrent.length.div_ceil(torrent.piece_length as u64);
        if expected != torrent.piece_hashes.len() as u64 {
            return Err(malformed("piece count does not match content length"));
        }

        Ok(torrent)
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of the piece at `index`: the full piece length for every
    /// piece but the last, which holds the remainder.
    pub fn piece_length_at(&self, index: u32) -> u32 {
        let begin = self.piece_offset(index);
        let end = (begin + self.piece_length as u64).min(self.length);
        (end - begin) as u32
    }

    /// Byte offset of the piece at `index` in the assembled buffer.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }
}

fn malformed(reason: &str) -> TorrentError {
    TorrentError::MalformedTorrent(reason.to_string())
}

/// Splits the concatenated `pieces` string into per-piece digests.
fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>, TorrentError> {
    if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
        return Err(TorrentError::MalformedPieces(pieces.len()));
    }

    let mut hashes = Vec::with_capacity(pieces.len() / SHA1_HASH_SIZE);
    for chunk in pieces.chunks_exact(SHA1_HASH_SIZE) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(chunk);
        hashes.push(hash);
    }

    Ok(hashes)
}

/// Reads the single-file `length` or the multi-file `files` list. Exactly
/// one of the two must be present.
fn read_layout(info: &Node) -> Result<(u64, Vec<FileEntry>), TorrentError> {
    let length = info.get(b"length");
    let files = info.get(b"files");

    match (length, files) {
        (Some(_), Some(_)) => Err(malformed("both length and files present")),
        (None, None) => Err(malformed("neither length nor files present")),
        (Some(node), None) => {
            let length = node
                .as_integer()
                .filter(|len| *len >= 0)
                .ok_or_else(|| malformed("invalid length"))?;
            Ok((length as u64, vec![]))
        }
        (None, Some(node)) => {
            let entries = node
                .as_list()
                .ok_or_else(|| malformed("files is not a list"))?;

            let mut parsed = Vec::with_capacity(entries.len());
            let mut total = 0u64;
            for entry in entries {
                let length = entry
                    .get(b"length")
                    .and_then(Node::as_integer)
                    .filter(|len| *len >= 0)
                    .ok_or_else(|| malformed("file entry missing length"))?;
                let path = entry
                    .get(b"path")
                    .and_then(Node::as_list)
                    .ok_or_else(|| malformed("file entry missing path"))?
                    .iter()
                    .map(|component| {
                        component
                            .as_str()
                            .map(str::to_string)
                            .ok_or_else(|| malformed("file path component is not a string"))
                    })
                    .collect::<Result<Vec<String>, TorrentError>>()?;

                total += length as u64;
                parsed.push(FileEntry {
                    length: length as u64,
                    path,
                });
            }

            Ok((total, parsed))
        }
    }
}
