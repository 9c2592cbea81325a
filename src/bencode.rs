//! # Bencode Codec
//!
//! Encoding and decoding for bencode, the self-describing format used by
//! torrent metainfo files and tracker responses. Four kinds exist: integers,
//! byte strings, lists, and dictionaries.
//!
//! Every decoded [`Node`] remembers the byte span it was read from, so a
//! caller can recover the exact source bytes of any sub-document. The
//! torrent layer relies on this to hash the `info` dictionary as it appeared
//! on disk; re-encoding before hashing would corrupt the torrent identity
//! whenever the source dictionary was not in canonical key order.
//!
//! Dictionaries are stored in a `BTreeMap`, so encoding always emits keys in
//! ascending bytewise order. Decoding accepts out-of-order keys.

use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Range;

use thiserror::Error;

/// Errors produced while decoding or encoding bencode data.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// A byte that no grammar rule allows at this position.
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    /// Input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A malformed decimal: empty, leading zeros, `-0`, or out of range.
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// The encoder's output sink failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One of the four bencode kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `i<decimal>e`
    Integer(i64),
    /// `<length>:<bytes>`, not necessarily UTF-8
    Bytes(Vec<u8>),
    /// `l<element>*e`
    List(Vec<Node>),
    /// `d(<key><value>)*e`, keys emitted in ascending bytewise order
    Dict(BTreeMap<Vec<u8>, Node>),
}

/// A decoded bencode value together with the byte span it came from.
///
/// Spans are absolute offsets into the buffer passed to [`decode`]; slicing
/// that buffer with a node's span yields a standalone bencode document that
/// decodes back to an equal node. Nodes built by hand (for encoding) carry
/// an empty span.
///
/// Equality is structural over values; spans are positional metadata and do
/// not participate.
#[derive(Debug, Clone)]
pub struct Node {
    /// The decoded value.
    pub value: Value,
    span: Range<usize>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Node {}

impl Node {
    fn synthetic(value: Value) -> Node {
        Node { value, span: 0..0 }
    }

    /// Builds an integer node.
    pub fn integer(value: i64) -> Node {
        Node::synthetic(Value::Integer(value))
    }

    /// Builds a byte-string node.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Node {
        Node::synthetic(Value::Bytes(bytes.into()))
    }

    /// Builds a byte-string node from UTF-8 text.
    pub fn string(s: &str) -> Node {
        Node::bytes(s.as_bytes().to_vec())
    }

    /// Builds a list node.
    pub fn list(items: Vec<Node>) -> Node {
        Node::synthetic(Value::List(items))
    }

    /// Builds a dictionary node.
    pub fn dict(entries: BTreeMap<Vec<u8>, Node>) -> Node {
        Node::synthetic(Value::Dict(entries))
    }

    /// The byte range this node was decoded from, as absolute offsets into
    /// the source buffer. Empty for hand-built nodes.
    pub fn span(&self) -> Range<usize> {
        self.span.clone()
    }

    /// Returns the integer value, if this node is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self.value {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this node is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8 text, if it is one and decodes.
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the elements, if this node is a list.
    pub fn as_list(&self) -> Option<&[Node]> {
        match &self.value {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the entries, if this node is a dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Node>> {
        match &self.value {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key, if this node is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Node> {
        self.as_dict()?.get(key)
    }
}

/// Decodes a single bencode document from `data`.
///
/// The whole input must be consumed; a trailing byte fails with
/// [`BencodeError::UnexpectedByte`].
pub fn decode(data: &[u8]) -> Result<Node, BencodeError> {
    let mut pos = 0;
    let node = decode_node(data, &mut pos)?;

    if pos != data.len() {
        return Err(BencodeError::UnexpectedByte {
            byte: data[pos],
            offset: pos,
        });
    }

    Ok(node)
}

fn decode_node(data: &[u8], pos: &mut usize) -> Result<Node, BencodeError> {
    let start = *pos;

    let value = match data.get(*pos) {
        None => return Err(BencodeError::UnexpectedEof),
        Some(b'i') => decode_integer(data, pos)?,
        Some(b'0'..=b'9') => decode_bytes(data, pos)?,
        Some(b'l') => decode_list(data, pos)?,
        Some(b'd') => decode_dict(data, pos)?,
        Some(&byte) => {
            return Err(BencodeError::UnexpectedByte { byte, offset: *pos });
        }
    };

    Ok(Node {
        value,
        span: start..*pos,
    })
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    // Skip 'i'
    *pos += 1;

    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let digits = &data[start..*pos];
    let value = parse_decimal(digits)?;

    // Skip 'e'
    *pos += 1;

    Ok(Value::Integer(value))
}

/// Parses a signed decimal with the bencode canonical-form rules: no empty
/// body, no `-0`, no leading zeros except the literal `0`.
fn parse_decimal(digits: &[u8]) -> Result<i64, BencodeError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| BencodeError::InvalidNumber("non-ascii digits".into()))?;

    if text.is_empty() || text == "-" {
        return Err(BencodeError::InvalidNumber("empty".into()));
    }
    // i64::from_str would take a leading '+', which the grammar does not
    if text.starts_with('+') || text.starts_with("-0") {
        return Err(BencodeError::InvalidNumber(text.into()));
    }
    if text.len() > 1 && text.starts_with('0') {
        return Err(BencodeError::InvalidNumber(text.into()));
    }

    text.parse()
        .map_err(|_| BencodeError::InvalidNumber(text.into()))
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    let start = *pos;
    while *pos < data.len() && data[*pos] != b':' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let len_text = std::str::from_utf8(&data[start..*pos])
        .map_err(|_| BencodeError::InvalidNumber("non-ascii length".into()))?;
    let len: usize = len_text
        .parse()
        .map_err(|_| BencodeError::InvalidNumber(len_text.into()))?;

    // Skip ':'
    *pos += 1;

    if data.len() - *pos < len {
        return Err(BencodeError::UnexpectedEof);
    }

    let bytes = data[*pos..*pos + len].to_vec();
    *pos += len;

    Ok(Value::Bytes(bytes))
}

fn decode_list(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    // Skip 'l'
    *pos += 1;

    let mut items = Vec::new();
    while *pos < data.len() && data[*pos] != b'e' {
        items.push(decode_node(data, pos)?);
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    // Skip 'e'
    *pos += 1;

    Ok(Value::List(items))
}

fn decode_dict(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    // Skip 'd'
    *pos += 1;

    let mut entries = BTreeMap::new();
    while *pos < data.len() && data[*pos] != b'e' {
        let key_start = *pos;
        let key = match decode_node(data, pos)?.value {
            Value::Bytes(b) => b,
            // Keys must be byte strings
            _ => {
                return Err(BencodeError::UnexpectedByte {
                    byte: data[key_start],
                    offset: key_start,
                });
            }
        };
        let value = decode_node(data, pos)?;
        entries.insert(key, value);
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    // Skip 'e'
    *pos += 1;

    Ok(Value::Dict(entries))
}

/// Encodes a node into a freshly allocated buffer.
pub fn encode(node: &Node) -> Result<Vec<u8>, BencodeError> {
    let mut buf = Vec::new();
    encode_into(node, &mut buf)?;
    Ok(buf)
}

/// Writes a node to `writer` and returns the number of bytes written.
///
/// Dictionaries are emitted with keys in ascending bytewise order, so any
/// decoded document re-encodes to its canonical form.
pub fn encode_into<W: Write>(node: &Node, writer: &mut W) -> Result<usize, BencodeError> {
    let written = match &node.value {
        Value::Integer(i) => {
            let text = format!("i{}e", i);
            writer.write_all(text.as_bytes())?;
            text.len()
        }
        Value::Bytes(b) => encode_bytes(b, writer)?,
        Value::List(items) => {
            writer.write_all(b"l")?;
            let mut len = 2;
            for item in items {
                len += encode_into(item, writer)?;
            }
            writer.write_all(b"e")?;
            len
        }
        Value::Dict(entries) => {
            writer.write_all(b"d")?;
            let mut len = 2;
            for (key, value) in entries {
                len += encode_bytes(key, writer)?;
                len += encode_into(value, writer)?;
            }
            writer.write_all(b"e")?;
            len
        }
    };

    Ok(written)
}

fn encode_bytes<W: Write>(bytes: &[u8], writer: &mut W) -> Result<usize, BencodeError> {
    let head = format!("{}:", bytes.len());
    writer.write_all(head.as_bytes())?;
    writer.write_all(bytes)?;
    Ok(head.len() + bytes.len())
}
