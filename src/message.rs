//! # Peer Wire Messages
//!
//! Framing for the post-handshake protocol. Every message is
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32), counting the ID byte and
//!   the payload
//! - **Message ID**: 1 byte
//! - **Payload**: `length - 1` bytes
//!
//! A length of zero is a keep-alive: no ID, no payload, modeled here as
//! `None`.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | empty |
//! | 1 | UNCHOKE | empty |
//! | 2 | INTERESTED | empty |
//! | 3 | NOT INTERESTED | empty |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | packed bit array |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |

use std::io::{Cursor, Read};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

/// A framed wire message. Keep-alives have no `Message` value; readers
/// surface them as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier.
    pub id: MessageId,
    /// Message payload data.
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a payload-less message.
    pub fn new(id: MessageId) -> Message {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Builds a message with a payload.
    pub fn with_payload(id: MessageId, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }

    /// Builds a REQUEST for `length` bytes at `begin` within piece `index`.
    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        Message::with_payload(MESSAGE_REQUEST, payload)
    }

    /// Builds a HAVE announcing piece `index`.
    pub fn have(index: u32) -> Message {
        Message::with_payload(MESSAGE_HAVE, index.to_be_bytes().to_vec())
    }

    /// Serializes the message with its length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let length = 1 + self.payload.len();
        let mut frame = Vec::with_capacity(4 + length);
        frame.extend_from_slice(&(length as u32).to_be_bytes());
        frame.push(self.id);
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Human-readable message name for logs.
    pub fn name(&self) -> &'static str {
        match self.id {
            MESSAGE_CHOKE => "CHOKE",
            MESSAGE_UNCHOKE => "UNCHOKE",
            MESSAGE_INTERESTED => "INTERESTED",
            MESSAGE_NOT_INTERESTED => "NOT_INTERESTED",
            MESSAGE_HAVE => "HAVE",
            MESSAGE_BITFIELD => "BITFIELD",
            MESSAGE_REQUEST => "REQUEST",
            MESSAGE_PIECE => "PIECE",
            MESSAGE_CANCEL => "CANCEL",
            _ => "UNKNOWN",
        }
    }
}

/// Reads one framed message from `reader`. A zero-length frame is a
/// keep-alive and yields `None`.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let mut length_buf = [0u8; 4];
    reader
        .read_exact(&mut length_buf)
        .map_err(|e| anyhow!("could not read message length: {e}"))?;
    let length = u32::from_be_bytes(length_buf) as usize;

    if length == 0 {
        return Ok(None);
    }

    let mut frame = vec![0u8; length];
    reader
        .read_exact(&mut frame)
        .map_err(|e| anyhow!("could not read message body: {e}"))?;

    Ok(Some(Message {
        id: frame[0],
        payload: frame[1..].to_vec(),
    }))
}

/// Parses a PIECE message and copies its block into `buf`.
///
/// The message must be a PIECE for piece `index` whose block fits entirely
/// within `buf`. Returns the number of bytes copied.
pub fn parse_piece(index: u32, buf: &mut [u8], message: &Message) -> Result<usize> {
    if message.id != MESSAGE_PIECE {
        return Err(anyhow!(
            "expected PIECE ({}), got id {}",
            MESSAGE_PIECE,
            message.id
        ));
    }
    if message.payload.len() < 8 {
        return Err(anyhow!(
            "malformed PIECE payload of {} bytes",
            message.payload.len()
        ));
    }

    let mut header = Cursor::new(&message.payload[..8]);
    let parsed_index = header.read_u32::<BigEndian>()?;
    if parsed_index != index {
        return Err(anyhow!("expected piece {index}, got {parsed_index}"));
    }

    let begin = header.read_u32::<BigEndian>()? as usize;
    if begin >= buf.len() {
        return Err(anyhow!("block offset {begin} beyond piece of {}", buf.len()));
    }

    let data = &message.payload[8..];
    if begin + data.len() > buf.len() {
        return Err(anyhow!(
            "block of {} bytes at offset {begin} overflows piece of {}",
            data.len(),
            buf.len()
        ));
    }

    buf[begin..begin + data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// Parses a HAVE message and returns the announced piece index.
pub fn parse_have(message: &Message) -> Result<u32> {
    if message.id != MESSAGE_HAVE {
        return Err(anyhow!(
            "expected HAVE ({}), got id {}",
            MESSAGE_HAVE,
            message.id
        ));
    }
    if message.payload.len() != 4 {
        return Err(anyhow!(
            "malformed HAVE payload of {} bytes",
            message.payload.len()
        ));
    }

    let index = Cursor::new(&message.payload).read_u32::<BigEndian>()?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_length_prefix() {
        let message = Message::with_payload(MESSAGE_HAVE, vec![1, 2, 3, 4]);
        assert_eq!(message.serialize(), [0, 0, 0, 5, 4, 1, 2, 3, 4]);

        let bare = Message::new(MESSAGE_INTERESTED);
        assert_eq!(bare.serialize(), [0, 0, 0, 1, 2]);
    }

    #[test]
    fn request_layout() {
        let message = Message::request(4, 567, 4321);
        assert_eq!(message.id, MESSAGE_REQUEST);
        assert_eq!(
            message.payload,
            [0, 0, 0, 4, 0, 0, 0x02, 0x37, 0, 0, 0x10, 0xe1]
        );
    }

    #[test]
    fn reads_framed_message() {
        let mut stream = Cursor::new(vec![0, 0, 0, 5, 4, 0, 0, 0, 9]);
        let message = read_message(&mut stream).unwrap().unwrap();
        assert_eq!(message.id, MESSAGE_HAVE);
        assert_eq!(message.payload, [0, 0, 0, 9]);
    }

    #[test]
    fn reads_keepalive_as_none() {
        let mut stream = Cursor::new(vec![0, 0, 0, 0]);
        assert_eq!(read_message(&mut stream).unwrap(), None);
    }

    #[test]
    fn read_fails_on_truncated_stream() {
        let mut stream = Cursor::new(vec![0, 0, 0, 5, 4, 0]);
        assert!(read_message(&mut stream).is_err());
    }

    #[test]
    fn parses_piece_into_buffer() {
        let mut buf = vec![0u8; 10];
        let message = Message::with_payload(
            MESSAGE_PIECE,
            vec![0, 0, 0, 4, 0, 0, 0, 2, 0xaa, 0xbb, 0xcc],
        );

        let copied = parse_piece(4, &mut buf, &message).unwrap();
        assert_eq!(copied, 3);
        assert_eq!(buf, [0, 0, 0xaa, 0xbb, 0xcc, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn rejects_bad_piece_messages() {
        let mut buf = vec![0u8; 10];

        // Wrong id
        let message = Message::with_payload(MESSAGE_CHOKE, vec![0; 11]);
        assert!(parse_piece(4, &mut buf, &message).is_err());

        // Payload too short
        let message = Message::with_payload(MESSAGE_PIECE, vec![0, 0, 0, 4, 0, 0, 0]);
        assert!(parse_piece(4, &mut buf, &message).is_err());

        // Wrong index
        let message =
            Message::with_payload(MESSAGE_PIECE, vec![0, 0, 0, 6, 0, 0, 0, 2, 0xaa]);
        assert!(parse_piece(4, &mut buf, &message).is_err());

        // Offset beyond the buffer
        let message =
            Message::with_payload(MESSAGE_PIECE, vec![0, 0, 0, 4, 0, 0, 0, 12, 0xaa]);
        assert!(parse_piece(4, &mut buf, &message).is_err());

        // Block overflows the buffer
        let message = Message::with_payload(
            MESSAGE_PIECE,
            vec![0, 0, 0, 4, 0, 0, 0, 8, 0xaa, 0xbb, 0xcc, 0xdd],
        );
        assert!(parse_piece(4, &mut buf, &message).is_err());
    }

    #[test]
    fn parses_have() {
        let message = Message::have(1337);
        assert_eq!(parse_have(&message).unwrap(), 1337);

        let wrong_id = Message::with_payload(MESSAGE_PIECE, vec![0, 0, 0, 1]);
        assert!(parse_have(&wrong_id).is_err());

        let short = Message::with_payload(MESSAGE_HAVE, vec![0, 0, 1]);
        assert!(parse_have(&short).is_err());
    }
}
