//! Schema-free index encoding.
//!
//! The structured index that follows the payload in every data message is a
//! tree of maps, lists and scalars. Wire format, all integers little-endian:
//!
//! ```text
//! value := tag:u8 body
//! 0x01 null
//! 0x02 bool   u8
//! 0x03 uint   u64
//! 0x04 int    i64
//! 0x05 float  f64
//! 0x06 str    len:u32 utf8
//! 0x07 bytes  len:u32 raw
//! 0x08 list   n:u32 value*n
//! 0x09 map    n:u32 (klen:u16 key value)*n
//! ```
//!
//! Every tag is below 0x10, which keeps small control records
//! distinguishable from data messages (whose first byte is the low byte of a
//! metadata offset of at least 16).

use crate::error::{Result, StreamError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_UINT: u8 = 0x03;
const TAG_INT: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_STR: u8 = 0x06;
const TAG_BYTES: u8 = 0x07;
const TAG_LIST: u8 = 0x08;
const TAG_MAP: u8 = 0x09;

/// Nesting limit when decoding untrusted input.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Null,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<IndexValue>),
    Map(BTreeMap<String, IndexValue>),
}

impl IndexValue {
    pub fn map() -> Self {
        Self::Map(BTreeMap::new())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[IndexValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, IndexValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, IndexValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up `key` when this is a map.
    pub fn get(&self, key: &str) -> Option<&IndexValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn from_dims(dims: &[u64]) -> Self {
        Self::List(dims.iter().map(|d| Self::UInt(*d)).collect())
    }

    pub fn to_dims(&self) -> Option<Vec<u64>> {
        self.as_list()?.iter().map(IndexValue::as_u64).collect()
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Null => buf.put_u8(TAG_NULL),
            Self::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Self::UInt(v) => {
                buf.put_u8(TAG_UINT);
                buf.put_u64_le(*v);
            }
            Self::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i64_le(*v);
            }
            Self::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64_le(*v);
            }
            Self::Str(s) => {
                buf.put_u8(TAG_STR);
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Self::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
            Self::List(items) => {
                buf.put_u8(TAG_LIST);
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    item.encode_into(buf);
                }
            }
            Self::Map(entries) => {
                buf.put_u8(TAG_MAP);
                buf.put_u32_le(entries.len() as u32);
                for (key, value) in entries {
                    buf.put_u16_le(key.len() as u16);
                    buf.put_slice(key.as_bytes());
                    value.encode_into(buf);
                }
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::UInt(_) | Self::Int(_) | Self::Float(_) => 8,
            Self::Str(s) => 4 + s.len(),
            Self::Bytes(b) => 4 + b.len(),
            Self::List(items) => 4 + items.iter().map(IndexValue::encoded_len).sum::<usize>(),
            Self::Map(entries) => {
                4 + entries
                    .iter()
                    .map(|(k, v)| 2 + k.len() + v.encoded_len())
                    .sum::<usize>()
            }
        }
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Decode exactly one value spanning all of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let value = Self::decode_from(&mut cursor, 0)?;
        if cursor.has_remaining() {
            return Err(StreamError::protocol(format!(
                "index has {} trailing bytes",
                cursor.remaining()
            )));
        }
        Ok(value)
    }

    fn decode_from(buf: &mut &[u8], depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(StreamError::protocol("index nesting too deep"));
        }
        need(buf, 1, "tag")?;
        let tag = buf.get_u8();
        let value = match tag {
            TAG_NULL => Self::Null,
            TAG_BOOL => {
                need(buf, 1, "bool")?;
                Self::Bool(buf.get_u8() != 0)
            }
            TAG_UINT => {
                need(buf, 8, "uint")?;
                Self::UInt(buf.get_u64_le())
            }
            TAG_INT => {
                need(buf, 8, "int")?;
                Self::Int(buf.get_i64_le())
            }
            TAG_FLOAT => {
                need(buf, 8, "float")?;
                Self::Float(buf.get_f64_le())
            }
            TAG_STR => {
                need(buf, 4, "string length")?;
                let len = buf.get_u32_le() as usize;
                Self::Str(take_str(buf, len)?)
            }
            TAG_BYTES => {
                need(buf, 4, "bytes length")?;
                let len = buf.get_u32_le() as usize;
                need(buf, len, "bytes")?;
                Self::Bytes(buf.copy_to_bytes(len))
            }
            TAG_LIST => {
                need(buf, 4, "list length")?;
                let n = buf.get_u32_le() as usize;
                // Every element takes at least one byte.
                need(buf, n, "list items")?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(Self::decode_from(buf, depth + 1)?);
                }
                Self::List(items)
            }
            TAG_MAP => {
                need(buf, 4, "map length")?;
                let n = buf.get_u32_le() as usize;
                let mut entries = BTreeMap::new();
                for _ in 0..n {
                    need(buf, 2, "key length")?;
                    let klen = buf.get_u16_le() as usize;
                    let key = take_str(buf, klen)?;
                    let value = Self::decode_from(buf, depth + 1)?;
                    entries.insert(key, value);
                }
                Self::Map(entries)
            }
            other => {
                return Err(StreamError::protocol(format!(
                    "unknown index tag 0x{:02x}",
                    other
                )))
            }
        };
        Ok(value)
    }
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(StreamError::protocol(format!(
            "index truncated reading {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_str(buf: &mut &[u8], len: usize) -> Result<String> {
    need(buf, len, "string")?;
    let (head, tail) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|e| StreamError::protocol(format!("invalid UTF-8 in index: {}", e)))?
        .to_string();
    *buf = tail;
    Ok(s)
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<u64> for IndexValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
