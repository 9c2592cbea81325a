//! # Peer Endpoints
//!
//! The [`Peer`] type names a remote endpoint the download coordinator may
//! connect to. Peers are produced by an external tracker client; the only
//! tracker detail this module understands is the compact wire format its
//! responses carry.
//!
//! ## Compact Peer Format
//!
//! Trackers answer with a binary string of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! both in network byte order.

use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

const COMPACT_PEER_SIZE: usize = 6;

/// A remote peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer.
    pub ip: Ipv4Addr,
    /// Port the peer accepts connections on.
    pub port: u16,
}

impl Peer {
    /// Builds a peer from address parts.
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }

    /// The peer's socket address.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parses a compact peer list as returned by a tracker.
///
/// Fails if the input is not a whole number of 6-byte entries.
pub fn from_compact(compact: &[u8]) -> Result<Vec<Peer>> {
    if !compact.len().is_multiple_of(COMPACT_PEER_SIZE) {
        return Err(anyhow!(
            "malformed compact peer list of length {}",
            compact.len()
        ));
    }

    let mut peers = Vec::with_capacity(compact.len() / COMPACT_PEER_SIZE);
    for entry in compact.chunks_exact(COMPACT_PEER_SIZE) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = Cursor::new(&entry[4..]).read_u16::<BigEndian>()?;
        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}
