//! # Grapnel
//!
//! The core of a BitTorrent leech client: given a parsed torrent descriptor
//! and a set of peer endpoints, grapnel drives one session per peer to
//! download and integrity-verify every piece of the torrent into a single
//! contiguous buffer.
//!
//! ## What lives here
//!
//! - A bencode codec that preserves the raw byte span of every decoded node,
//!   so the torrent's identity hash is computed over the original `info`
//!   bytes rather than a re-encoding
//! - The peer wire protocol: fixed handshake, length-prefixed messages,
//!   choke/interest flow control
//! - A piece scheduler: one worker per peer pulling from a shared work
//!   queue, pipelining 16 KiB block requests, verifying each piece against
//!   its SHA-1 digest, and requeueing on failure
//!
//! ## What does not
//!
//! Tracker communication, disk layout, configuration, and seeding are left
//! to the caller. The entry point is [`download::download`], which returns
//! the assembled byte buffer once every piece has been verified.
//!
//! ## Architecture
//!
//! - **Coordinator**: seeds the work queue, collects verified pieces,
//!   reassembles the output buffer
//! - **Worker threads**: one per peer, each owning its TCP session
//! - **Channels**: crossbeam channels carry work items out and results back;
//!   requeue through the work channel is the only way a piece moves between
//!   workers

pub mod bencode;
pub mod client;
pub mod download;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod worker;

pub use download::{download, generate_peer_id};
pub use peer::Peer;
pub use torrent::Torrent;
