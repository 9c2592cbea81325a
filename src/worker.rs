//! # Piece Worker
//!
//! One worker per peer. A worker establishes its session, then consumes
//! piece work items from the shared queue until the queue closes, the
//! coordinator signals shutdown, or the session fails.
//!
//! ## Download Process
//!
//! 1. **Connect**: handshake and initial bitfield via [`Client::connect`]
//! 2. **Unchoke + Interested**: sent once, immediately
//! 3. **Work loop**: take a piece; skip (requeue) pieces the peer lacks
//! 4. **Pipelining**: keep up to 5 block requests of 16 KiB in flight
//! 5. **Verification**: SHA-1 over the assembled piece
//! 6. **Result**: hand the verified buffer to the coordinator
//!
//! ## Failure policy
//!
//! Any error while downloading a piece — I/O, protocol violation, the 30
//! second piece deadline, a digest mismatch — requeues the piece for some
//! other worker and terminates this one. A peer that fails once is not
//! trusted with further work; there is no reconnection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::client::Client;
use crate::message::{
    self, MESSAGE_BITFIELD, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_PIECE, MESSAGE_UNCHOKE,
};
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};

/// Maximum number of block requests in flight per peer.
const MAX_BACKLOG: u32 = 5;

/// Size of one block request (16 KiB); the last block of a piece may be
/// smaller.
const BLOCK_SIZE: u32 = 16384;

/// Wall-clock deadline for downloading a single piece.
const PIECE_DEADLINE: Duration = Duration::from_secs(30);

/// Downloads pieces from a single peer on behalf of the coordinator.
pub struct Worker {
    peer: Peer,
    peer_id: [u8; 20],
    info_hash: [u8; 20],
    work_tx: Sender<PieceWork>,
    work_rx: Receiver<PieceWork>,
    result_tx: Sender<PieceResult>,
    shutdown_rx: Receiver<()>,
    active: Arc<AtomicUsize>,
}

/// In-flight state for one download attempt of one piece.
struct PieceProgress {
    buf: Vec<u8>,
    downloaded: u32,
    requested: u32,
    backlog: u32,
}

/// Scope guard for the coordinator's active-session counter.
struct ActiveSession<'a>(&'a AtomicUsize);

impl<'a> ActiveSession<'a> {
    fn enter(counter: &'a AtomicUsize) -> ActiveSession<'a> {
        counter.fetch_add(1, Ordering::SeqCst);
        ActiveSession(counter)
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Worker {
    /// Builds a worker for one peer endpoint.
    pub fn new(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
        work: (Sender<PieceWork>, Receiver<PieceWork>),
        result_tx: Sender<PieceResult>,
        shutdown_rx: Receiver<()>,
        active: Arc<AtomicUsize>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work_tx: work.0,
            work_rx: work.1,
            result_tx,
            shutdown_rx,
            active,
        }
    }

    /// Runs the worker until the download completes or the session fails.
    ///
    /// A worker whose session cannot be established never starts; one that
    /// fails mid-piece requeues its item and returns.
    pub fn run(self) {
        let mut client = match Client::connect(self.peer, self.info_hash, self.peer_id) {
            Ok(client) => client,
            Err(e) => {
                debug!("Could not start session with peer {}: {e:#}", self.peer);
                return;
            }
        };

        let _session = ActiveSession::enter(&self.active);

        if let Err(e) = client.send_unchoke().and_then(|()| client.send_interested()) {
            debug!("Peer {} failed before first piece: {e:#}", self.peer);
            return;
        }

        loop {
            let work = select! {
                recv(self.work_rx) -> item => match item {
                    Ok(work) => work,
                    // Queue closed: nothing left to do
                    Err(_) => return,
                },
                recv(self.shutdown_rx) -> _ => {
                    debug!("Worker for peer {} shutting down", self.peer);
                    return;
                }
            };

            // Skip pieces this peer does not have; some other worker will
            // pick them up.
            if !client.has_piece(work.index) {
                self.requeue(work);
                continue;
            }

            match download_piece(&mut client, &work) {
                Ok(data) => {
                    // Courtesy HAVE; the piece is already safe
                    if let Err(e) = client.send_have(work.index) {
                        debug!("Could not send HAVE to peer {}: {e:#}", self.peer);
                    }

                    let index = work.index;
                    if self.result_tx.send(PieceResult::new(index, data)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Abandoning peer {}: {e:#}", self.peer);
                    self.requeue(work);
                    return;
                }
            }
        }
    }

    fn requeue(&self, work: PieceWork) {
        // The queue is bounded at the number of pieces and seeded once, so
        // putting an item back can never block.
        if self.work_tx.send(work).is_err() {
            error!("could not return piece to the work queue");
        }
    }
}

/// Downloads and verifies one piece over an established session.
fn download_piece(client: &mut Client, work: &PieceWork) -> Result<Vec<u8>> {
    let mut progress = PieceProgress {
        buf: vec![0; work.length as usize],
        downloaded: 0,
        requested: 0,
        backlog: 0,
    };
    let deadline = Instant::now() + PIECE_DEADLINE;

    while progress.downloaded < work.length {
        // While unchoked, keep the request pipeline full.
        if !client.is_choked() {
            while progress.backlog < MAX_BACKLOG && progress.requested < work.length {
                let block_size = BLOCK_SIZE.min(work.length - progress.requested);
                client.send_request(work.index, progress.requested, block_size)?;
                progress.backlog += 1;
                progress.requested += block_size;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("timed out downloading piece {}", work.index));
        }
        client.set_read_timeout(remaining)?;

        let message = match client.read_message()? {
            Some(message) => message,
            None => continue, // keep-alive
        };

        match message.id {
            MESSAGE_CHOKE => {
                client.read_choke();
                warn!("Peer {} choked us, waiting for unchoke", client.peer());
            }
            MESSAGE_UNCHOKE => client.read_unchoke(),
            MESSAGE_HAVE => client.set_piece(message::parse_have(&message)?),
            MESSAGE_BITFIELD => client.replace_bitfield(message.payload),
            MESSAGE_PIECE => {
                let copied = message::parse_piece(work.index, &mut progress.buf, &message)?;
                progress.downloaded += copied as u32;
                progress.backlog = progress.backlog.saturating_sub(1);
            }
            _ => debug!(
                "Ignoring {} from peer {}",
                message.name(),
                client.peer()
            ),
        }
    }

    let mut hasher = Sha1::new();
    hasher.update(&progress.buf);
    if hasher.finish() != work.hash {
        return Err(anyhow!("hash mismatch for piece {}", work.index));
    }

    info!("Downloaded and verified piece {}", work.index);

    Ok(progress.buf)
}
