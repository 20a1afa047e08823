//! Fixed-layout announcement record exchanged during the handshake.
//!
//! ```text
//! +------+------------+------------+----------------------------------+
//! | mode | master u32 | group u32  | stream name, NUL-padded          |
//! +------+------------+------------+----------------------------------+
//!   1 B      4 B LE       4 B LE      max_filename_length bytes
//! ```

use crate::error::{Result, StreamError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed part of the record before the stream name.
pub const ANNOUNCEMENT_PREFIX: usize = 9;

/// Which side of a stream a process opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    Write,
    Read,
}

impl StreamMode {
    fn tag(self) -> u8 {
        match self {
            Self::Write => b'w',
            Self::Read => b'r',
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'w' => Some(Self::Write),
            b'r' => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub mode: StreamMode,
    /// Pool rank of the announcing process's local-group master.
    pub master: u32,
    pub group_size: u32,
    pub stream: String,
}

impl Announcement {
    pub fn encode(&self, max_filename_length: usize) -> Result<Bytes> {
        let name = self.stream.as_bytes();
        if name.len() > max_filename_length {
            return Err(StreamError::config(format!(
                "stream name `{}` is {} bytes, the limit is {}",
                self.stream,
                name.len(),
                max_filename_length
            )));
        }
        let mut buf = BytesMut::with_capacity(ANNOUNCEMENT_PREFIX + max_filename_length);
        buf.put_u8(self.mode.tag());
        buf.put_u32_le(self.master);
        buf.put_u32_le(self.group_size);
        buf.put_slice(name);
        buf.put_bytes(0, max_filename_length - name.len());
        Ok(buf.freeze())
    }

    pub fn decode(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < ANNOUNCEMENT_PREFIX {
            return Err(StreamError::protocol(format!(
                "announcement of {} bytes is truncated",
                raw.len()
            )));
        }
        let tag = raw.get_u8();
        let mode = StreamMode::from_tag(tag)
            .ok_or_else(|| StreamError::protocol(format!("unknown announcement mode 0x{:02x}", tag)))?;
        let master = raw.get_u32_le();
        let group_size = raw.get_u32_le();
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let stream = std::str::from_utf8(&raw[..end])
            .map_err(|e| StreamError::protocol(format!("announcement name is not UTF-8: {}", e)))?
            .to_string();
        Ok(Self {
            mode,
            master,
            group_size,
            stream,
        })
    }
}
