//! # Peer Session
//!
//! A [`Client`] owns the TCP connection to one remote peer and carries the
//! per-session protocol state: whether the peer has choked us and which
//! pieces it claims to have.
//!
//! ## Connection sequence
//!
//! 1. TCP connect (3 second timeout)
//! 2. Handshake exchange, validated against our info-hash (3 seconds)
//! 3. The peer's BITFIELD, which must be its first message (5 seconds)
//!
//! Any failure closes the connection and fails the session; the worker that
//! owned it never starts.
//!
//! ## Bitfield Encoding
//!
//! Each byte covers 8 pieces, most significant bit first:
//!
//! ```text
//! Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]
//! Byte 1: [piece 8, 9, 10, 11, 12, 13, 14, 15]
//! ...
//! ```

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, info};

use crate::handshake::{self, Handshake};
use crate::message::{self, Message, MESSAGE_BITFIELD};
use crate::peer::Peer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Packed big-endian bit array stating which pieces a peer has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    /// Wraps the raw bytes of a BITFIELD payload.
    pub fn new(bits: Vec<u8>) -> Bitfield {
        Bitfield(bits)
    }

    /// Whether bit `index` is set. Out-of-range indexes read as unset.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.0.get(byte_index) {
            Some(byte) => (byte >> (7 - offset)) & 1 != 0,
            None => false,
        }
    }

    /// Sets bit `index`, growing the array if the peer announced a piece
    /// beyond its original bitfield.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.0.len() {
            self.0.resize(byte_index + 1, 0);
        }
        self.0[byte_index] |= 1 << (7 - offset);
    }
}

/// A live session with one remote peer.
///
/// Owned exclusively by a single worker for the session's lifetime; the
/// connection closes when the client is dropped.
pub struct Client {
    conn: TcpStream,
    peer: Peer,
    choked: bool,
    bitfield: Bitfield,
}

impl Client {
    /// Connects to a peer and runs the connection sequence: handshake
    /// exchange, info-hash validation, initial bitfield.
    pub fn connect(peer: Peer, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<Client> {
        let conn = TcpStream::connect_timeout(&peer.addr(), CONNECT_TIMEOUT)
            .map_err(|e| anyhow!("could not connect to peer {peer}: {e}"))?;

        complete_handshake(&conn, info_hash, peer_id)
            .map_err(|e| anyhow!("handshake with peer {peer} failed: {e}"))?;
        let bitfield = recv_bitfield(&conn)
            .map_err(|e| anyhow!("could not read bitfield from peer {peer}: {e}"))?;

        // The connection sequence leaves whatever remained of its deadline
        // on the socket; give the session a steady write timeout for its
        // small control messages. Reads are re-armed per piece deadline.
        conn.set_write_timeout(Some(WRITE_TIMEOUT))?;

        info!("Connected to peer {peer}");

        Ok(Client {
            conn,
            peer,
            choked: true,
            bitfield,
        })
    }

    /// Whether the peer currently has us choked. Sessions start choked.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Records a CHOKE from the peer.
    pub fn read_choke(&mut self) {
        debug!("Receive CHOKE from peer {}", self.peer);
        self.choked = true;
    }

    /// Records an UNCHOKE from the peer.
    pub fn read_unchoke(&mut self) {
        debug!("Receive UNCHOKE from peer {}", self.peer);
        self.choked = false;
    }

    /// Whether the peer claims to have piece `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Marks piece `index` in the peer's bitfield, from a HAVE message.
    pub fn set_piece(&mut self, index: u32) {
        self.bitfield.set_piece(index);
    }

    /// Replaces the stored bitfield when a peer resends one mid-session.
    pub fn replace_bitfield(&mut self, bits: Vec<u8>) {
        debug!("Replacing bitfield for peer {}", self.peer);
        self.bitfield = Bitfield::new(bits);
    }

    /// Rearms the read timeout on the underlying stream. The worker uses
    /// this to hold the whole-piece deadline across individual reads.
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn
            .set_read_timeout(Some(timeout))
            .map_err(|e| anyhow!("could not set read timeout: {e}"))?;
        Ok(())
    }

    /// Reads the next framed message; `None` is a keep-alive.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        message::read_message(&mut self.conn)
    }

    /// Sends a REQUEST for a block.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        debug!(
            "Send REQUEST for piece {index} [{begin}:{}] to peer {}",
            begin + length,
            self.peer
        );
        self.send(&Message::request(index, begin, length))
    }

    /// Tells the peer we want to download from it.
    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Send INTERESTED to peer {}", self.peer);
        self.send(&Message::new(message::MESSAGE_INTERESTED))
    }

    /// Tells the peer we no longer want to download from it.
    pub fn send_not_interested(&mut self) -> Result<()> {
        debug!("Send NOT_INTERESTED to peer {}", self.peer);
        self.send(&Message::new(message::MESSAGE_NOT_INTERESTED))
    }

    /// Tells the peer it may request from us.
    pub fn send_unchoke(&mut self) -> Result<()> {
        debug!("Send UNCHOKE to peer {}", self.peer);
        self.send(&Message::new(message::MESSAGE_UNCHOKE))
    }

    /// Announces that we now have piece `index`.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        debug!("Send HAVE for piece {index} to peer {}", self.peer);
        self.send(&Message::have(index))
    }

    /// The endpoint this session is connected to.
    pub fn peer(&self) -> Peer {
        self.peer
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        self.conn
            .write_all(&message.serialize())
            .map_err(|e| anyhow!("could not send {} to peer {}: {e}", message.name(), self.peer))
    }
}

/// Read/write adapter that holds a fixed wall-clock deadline over a whole
/// exchange.
///
/// Socket timeouts bound one syscall, not an exchange, so a peer trickling
/// bytes could stretch a "3 second" step indefinitely. Before every syscall
/// this rearms the socket timeout with the time left until the deadline and
/// errors with `TimedOut` once that reaches zero.
struct DeadlineStream<'a> {
    conn: &'a TcpStream,
    deadline: Instant,
}

impl<'a> DeadlineStream<'a> {
    fn new(conn: &'a TcpStream, timeout: Duration) -> DeadlineStream<'a> {
        DeadlineStream {
            conn,
            deadline: Instant::now() + timeout,
        }
    }

    fn remaining(&self) -> io::Result<Duration> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed"));
        }
        Ok(remaining)
    }
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.set_read_timeout(Some(self.remaining()?))?;
        Read::read(&mut self.conn, buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.set_write_timeout(Some(self.remaining()?))?;
        Write::write(&mut self.conn, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.conn)
    }
}

/// Exchanges handshakes and checks that the peer serves our torrent. The
/// whole exchange, send and receive, shares one 3 second deadline.
fn complete_handshake(conn: &TcpStream, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<()> {
    let mut stream = DeadlineStream::new(conn, HANDSHAKE_TIMEOUT);

    let ours = Handshake::new(info_hash, peer_id);
    stream.write_all(&ours.serialize())?;

    let theirs = handshake::read_handshake(&mut stream)?;
    if theirs.info_hash != info_hash {
        return Err(anyhow!("handshake info-hash mismatch"));
    }

    Ok(())
}

/// Reads the mandatory first message, which must be a BITFIELD, under one
/// 5 second deadline.
fn recv_bitfield(conn: &TcpStream) -> Result<Bitfield> {
    let mut stream = DeadlineStream::new(conn, BITFIELD_TIMEOUT);

    let message = message::read_message(&mut stream)?
        .ok_or_else(|| anyhow!("expected bitfield, got keep-alive"))?;
    if message.id != MESSAGE_BITFIELD {
        return Err(anyhow!("expected bitfield, got id {}", message.id));
    }

    Ok(Bitfield::new(message.payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    #[test]
    fn bitfield_reads_packed_bits() {
        let bitfield = Bitfield::new(vec![0b0101_0100, 0b0101_0100]);
        let expected = [
            false, true, false, true, false, true, false, false, //
            false, true, false, true, false, true, false, false,
        ];
        for (index, &has) in expected.iter().enumerate() {
            assert_eq!(bitfield.has_piece(index as u32), has, "piece {index}");
        }
        // Out of range reads as unset
        assert!(!bitfield.has_piece(16));
        assert!(!bitfield.has_piece(400));
    }

    #[test]
    fn bitfield_set_then_has() {
        let mut bitfield = Bitfield::new(vec![0; 2]);
        for index in [0, 3, 7, 8, 15] {
            assert!(!bitfield.has_piece(index));
            bitfield.set_piece(index);
            assert!(bitfield.has_piece(index), "piece {index}");
        }
        // Setting past the end grows the array
        bitfield.set_piece(70);
        assert!(bitfield.has_piece(70));
        assert!(!bitfield.has_piece(69));
    }

    /// Serves one scripted connection: reads the client handshake, answers
    /// with `info_hash`, then sends `first_message`.
    fn scripted_peer(info_hash: [u8; 20], first_message: Vec<u8>) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut theirs = [0u8; 68];
            conn.read_exact(&mut theirs).unwrap();

            let ours = Handshake::new(info_hash, [9; 20]);
            conn.write_all(&ours.serialize()).unwrap();
            conn.write_all(&first_message).unwrap();
        });

        Peer::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn connects_and_reads_bitfield() {
        let info_hash = [7; 20];
        let bitfield = Message::with_payload(MESSAGE_BITFIELD, vec![0b1010_0000]);
        let peer = scripted_peer(info_hash, bitfield.serialize());

        let client = Client::connect(peer, info_hash, [1; 20]).unwrap();
        assert!(client.is_choked());
        assert!(client.has_piece(0));
        assert!(!client.has_piece(1));
        assert!(client.has_piece(2));
    }

    #[test]
    fn rejects_info_hash_mismatch() {
        let bitfield = Message::with_payload(MESSAGE_BITFIELD, vec![0xff]);
        let peer = scripted_peer([8; 20], bitfield.serialize());

        assert!(Client::connect(peer, [7; 20], [1; 20]).is_err());
    }

    #[test]
    fn rejects_non_bitfield_first_message() {
        let info_hash = [7; 20];
        let unchoke = Message::new(message::MESSAGE_UNCHOKE);
        let peer = scripted_peer(info_hash, unchoke.serialize());

        assert!(Client::connect(peer, info_hash, [1; 20]).is_err());
    }
}
