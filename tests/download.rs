//! End-to-end downloads against scripted peers served from in-process
//! TCP listeners.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use boring::sha::Sha1;

use grapnel::peer::Peer;
use grapnel::torrent::Torrent;

const PIECE_LENGTH: u32 = 262_144;
const TOTAL_LENGTH: usize = 1_048_576;
const BLOCK_SIZE: usize = 16_384;

const MESSAGE_UNCHOKE: u8 = 1;
const MESSAGE_BITFIELD: u8 = 5;
const MESSAGE_REQUEST: u8 = 6;
const MESSAGE_PIECE: u8 = 7;

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish()
}

/// Deterministic, piece-to-piece distinct content.
fn make_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn make_torrent(content: &[u8], piece_length: u32) -> Torrent {
    let piece_hashes = content
        .chunks(piece_length as usize)
        .map(sha1)
        .collect::<Vec<_>>();

    Torrent {
        announce: "http://tracker.test/".to_string(),
        info_hash: sha1(b"scripted swarm"),
        piece_hashes,
        piece_length,
        length: content.len() as u64,
        name: "scripted.bin".to_string(),
        files: vec![],
    }
}

fn write_message(conn: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    let length = (1 + payload.len()) as u32;
    conn.write_all(&length.to_be_bytes())?;
    conn.write_all(&[id])?;
    conn.write_all(payload)
}

fn read_frame(conn: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut length_buf = [0u8; 4];
    conn.read_exact(&mut length_buf)?;
    let mut frame = vec![0u8; u32::from_be_bytes(length_buf) as usize];
    conn.read_exact(&mut frame)?;
    Ok(frame)
}

/// Serves one download session: handshake, full bitfield, a keep-alive,
/// an unchoke, then blocks for every request until the client hangs up.
/// A corrupting peer answers every request with flipped bytes but the
/// correct length.
fn spawn_scripted_peer(torrent: &Torrent, content: Arc<Vec<u8>>, corrupt: bool) -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let info_hash = torrent.info_hash;
    let num_pieces = torrent.num_pieces();
    let piece_length = torrent.piece_length as usize;

    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();

        // Handshake exchange
        let mut theirs = [0u8; 68];
        if conn.read_exact(&mut theirs).is_err() {
            return;
        }
        let mut ours = Vec::with_capacity(68);
        ours.push(19);
        ours.extend_from_slice(b"BitTorrent protocol");
        ours.extend_from_slice(&[0u8; 8]);
        ours.extend_from_slice(&info_hash);
        ours.extend_from_slice(&[b'S'; 20]);
        if conn.write_all(&ours).is_err() {
            return;
        }

        // Everything, according to the bitfield
        let mut bits = vec![0u8; num_pieces.div_ceil(8)];
        for index in 0..num_pieces {
            bits[index / 8] |= 1 << (7 - index % 8);
        }
        if write_message(&mut conn, MESSAGE_BITFIELD, &bits).is_err() {
            return;
        }

        // A keep-alive, then permission to request
        let _ = conn.write_all(&0u32.to_be_bytes());
        if write_message(&mut conn, MESSAGE_UNCHOKE, &[]).is_err() {
            return;
        }

        // Serve blocks until the client disconnects
        while let Ok(frame) = read_frame(&mut conn) {
            if frame.is_empty() || frame[0] != MESSAGE_REQUEST {
                continue;
            }

            let index = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
            let begin = u32::from_be_bytes(frame[5..9].try_into().unwrap()) as usize;
            let length = u32::from_be_bytes(frame[9..13].try_into().unwrap()) as usize;

            let offset = index * piece_length + begin;
            let mut block = content[offset..offset + length].to_vec();
            if corrupt {
                for byte in &mut block {
                    *byte = !*byte;
                }
            }

            let mut payload = Vec::with_capacity(8 + block.len());
            payload.extend_from_slice(&(index as u32).to_be_bytes());
            payload.extend_from_slice(&(begin as u32).to_be_bytes());
            payload.extend_from_slice(&block);
            if write_message(&mut conn, MESSAGE_PIECE, &payload).is_err() {
                return;
            }
        }
    });

    Peer::new(Ipv4Addr::LOCALHOST, port)
}

#[test]
fn downloads_from_cooperative_swarm() {
    let content = make_content(TOTAL_LENGTH);
    let torrent = make_torrent(&content, PIECE_LENGTH);
    assert_eq!(torrent.num_pieces(), 4);

    let shared = Arc::new(content.clone());
    let peers: Vec<Peer> = (0..2)
        .map(|_| spawn_scripted_peer(&torrent, Arc::clone(&shared), false))
        .collect();

    let buf = grapnel::download(&torrent, grapnel::generate_peer_id(), &peers).unwrap();

    assert_eq!(buf.len(), TOTAL_LENGTH);
    assert_eq!(buf, content);
    for (index, window) in buf.chunks(PIECE_LENGTH as usize).enumerate() {
        assert_eq!(sha1(window), torrent.piece_hashes[index], "piece {index}");
    }
}

#[test]
fn survives_a_corrupting_peer() {
    // Small pieces keep the retry path quick
    let content = make_content(8 * BLOCK_SIZE);
    let torrent = make_torrent(&content, 2 * BLOCK_SIZE as u32);
    assert_eq!(torrent.num_pieces(), 4);

    let shared = Arc::new(content.clone());
    let corrupt = spawn_scripted_peer(&torrent, Arc::clone(&shared), true);
    let honest = spawn_scripted_peer(&torrent, Arc::clone(&shared), false);

    // The corrupting peer fails hash verification on its first piece; that
    // piece must flow back through the queue and land via the honest peer.
    let buf = grapnel::download(&torrent, grapnel::generate_peer_id(), &[corrupt, honest]).unwrap();

    assert_eq!(buf, content);
}

#[test]
fn fails_cleanly_when_every_session_dies() {
    let content = make_content(4 * BLOCK_SIZE);
    let torrent = make_torrent(&content, 2 * BLOCK_SIZE as u32);

    let shared = Arc::new(content);
    let corrupt = spawn_scripted_peer(&torrent, Arc::clone(&shared), true);

    // The only peer serves garbage, so its session terminates and no piece
    // can ever complete.
    let result = grapnel::download(&torrent, grapnel::generate_peer_id(), &[corrupt]);
    assert!(result.is_err());
}
