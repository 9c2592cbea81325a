//! # Download Coordinator
//!
//! Owns the work queue and the result channel, spawns one worker per peer,
//! and reassembles verified pieces into the output buffer.
//!
//! ## Coordination
//!
//! - The work queue is bounded at the number of pieces and seeded up front,
//!   so a worker returning an item never blocks
//! - Results arrive unordered across peers; the coordinator places each at
//!   `index * piece_length`
//! - When the last piece lands, dropping the shutdown channel's sender
//!   releases every worker still waiting for work
//!
//! The channels are the only synchronization points; each peer session is
//! owned by exactly one worker thread. An atomic counter of established
//! sessions feeds the progress log.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rand::Rng;

use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::torrent::Torrent;
use crate::worker::Worker;

/// Generates a random 20-byte peer id for this client instance.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let mut rng = rand::thread_rng();
    for byte in peer_id.iter_mut() {
        *byte = rng.gen();
    }
    peer_id
}

/// Downloads the torrent's full contents from `peers` into one contiguous
/// buffer, verifying every piece against its declared digest.
///
/// Workers that fail terminate quietly and their pieces flow back through
/// the queue; the download keeps going as long as at least one session
/// remains. If every session ends with pieces still missing, an error
/// reports how much was left.
pub fn download(torrent: &Torrent, peer_id: [u8; 20], peers: &[Peer]) -> Result<Vec<u8>> {
    if peers.is_empty() {
        return Err(anyhow!("no peers to download from"));
    }

    info!(
        "Downloading {:?} ({} pieces from {} peers)",
        torrent.name,
        torrent.num_pieces(),
        peers.len()
    );

    let num_pieces = torrent.num_pieces();
    let (work_tx, work_rx) = bounded::<PieceWork>(num_pieces);
    let (result_tx, result_rx) = unbounded::<PieceResult>();
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let active = Arc::new(AtomicUsize::new(0));

    // Seed one work item per piece
    for (index, hash) in torrent.piece_hashes.iter().enumerate() {
        let index = index as u32;
        let work = PieceWork::new(index, *hash, torrent.piece_length_at(index));
        work_tx
            .send(work)
            .map_err(|_| anyhow!("could not seed the work queue"))?;
    }

    for &peer in peers {
        let worker = Worker::new(
            peer,
            peer_id,
            torrent.info_hash,
            (work_tx.clone(), work_rx.clone()),
            result_tx.clone(),
            shutdown_rx.clone(),
            Arc::clone(&active),
        );
        thread::spawn(move || worker.run());
    }

    // Workers hold the only producer handles now: once every session has
    // ended, the result channel closes.
    drop(work_tx);
    drop(work_rx);
    drop(result_tx);

    let bar = ProgressBar::new(torrent.length);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );

    let mut buf = vec![0u8; torrent.length as usize];
    let mut done = 0;
    while done < num_pieces {
        let result = match result_rx.recv() {
            Ok(result) => result,
            Err(_) => {
                return Err(anyhow!(
                    "all peer sessions ended with {} of {} pieces missing",
                    num_pieces - done,
                    num_pieces
                ));
            }
        };

        let begin = torrent.piece_offset(result.index) as usize;
        buf[begin..begin + result.data.len()].copy_from_slice(&result.data);
        done += 1;

        bar.inc(result.data.len() as u64);
        info!(
            "({:.2}%) Downloaded piece #{} from {} peers",
            done as f64 / num_pieces as f64 * 100.0,
            result.index,
            active.load(Ordering::SeqCst)
        );
    }
    bar.finish();

    // Release workers still parked on the queue; in-flight TCP reads end
    // when their deadlines fire.
    drop(shutdown_tx);

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Torrent;

    #[test]
    fn peer_ids_are_20_random_bytes() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_empty_peer_list() {
        let torrent = Torrent {
            announce: String::new(),
            info_hash: [0; 20],
            piece_hashes: vec![[0; 20]],
            piece_length: 1,
            length: 1,
            name: String::new(),
            files: vec![],
        };
        assert!(download(&torrent, [0; 20], &[]).is_err());
    }
}
