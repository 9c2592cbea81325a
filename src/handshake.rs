//! # Handshake
//!
//! The fixed 68-byte frame that opens every peer connection:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, always 19
//! - **pstr**: the literal `"BitTorrent protocol"`
//! - **reserved**: 8 bytes, all zero (extension bits, unused here)
//! - **info_hash**: 20 bytes identifying the torrent
//! - **peer_id**: 20 bytes identifying the sender
//!
//! Reading validates the protocol prefix; the info-hash comparison belongs
//! to the session layer, and the peer-id is not validated at all.

use std::io::Read;

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake frame on the wire.
pub const HANDSHAKE_SIZE: usize = 68;

/// The identifying fields of a handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// SHA-1 of the torrent's info dictionary.
    pub info_hash: [u8; 20],
    /// The sender's 20-byte peer id.
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Builds a handshake for the given torrent and sender identity.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HANDSHAKE_SIZE);
        frame.push(PROTOCOL_ID.len() as u8);
        frame.extend_from_slice(PROTOCOL_ID);
        frame.extend_from_slice(&[0u8; 8]);
        frame.extend_from_slice(&self.info_hash);
        frame.extend_from_slice(&self.peer_id);
        frame
    }
}

/// Reads a peer's handshake frame and validates the protocol prefix.
///
/// Rejects a pstrlen other than 19 and any protocol string other than
/// `"BitTorrent protocol"`. Reserved bytes are ignored.
pub fn read_handshake<R: Read>(reader: &mut R) -> Result<Handshake> {
    let mut pstrlen = [0u8; 1];
    reader
        .read_exact(&mut pstrlen)
        .map_err(|e| anyhow!("could not read handshake length: {e}"))?;
    if pstrlen[0] as usize != PROTOCOL_ID.len() {
        return Err(anyhow!("invalid handshake length {}", pstrlen[0]));
    }

    let mut rest = [0u8; HANDSHAKE_SIZE - 1];
    reader
        .read_exact(&mut rest)
        .map_err(|e| anyhow!("could not read handshake: {e}"))?;

    if &rest[..19] != PROTOCOL_ID {
        return Err(anyhow!("unknown protocol in handshake"));
    }

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&rest[27..47]);
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&rest[47..67]);

    Ok(Handshake { info_hash, peer_id })
}
