//! AOF record framing.
//!
//! ## On-disk layout
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ key:   i32 LE (4 bytes)              │
//! │ size:  u32 LE (4 bytes)              │
//! │ bytes: [u8; size]                    │
//! │ crc:   crc32c(key‖size‖bytes) LE (4) │
//! ├──────────────────────────────────────┤
//! │ next record ...                      │
//! └──────────────────────────────────────┘
//! ```
//!
//! No file header, no segment markers; readers stop at a clean EOF.
//! A record is framed into ONE contiguous buffer so a single `write(2)` on
//! an `O_APPEND` descriptor lands it atomically even when sibling worker
//! processes append to the same file.
//!
//! The RDB shares the `key|size|bytes` triple layout but checksums the
//! whole payload once (see `snapshot`), so the triple encoder is split out.

use crate::checksum::crc32c;
use crate::persistence::PersistError;
use bytes::{BufMut, BytesMut};
use std::io::Read;

/// key(4) + size(4) + crc(4)
pub const RECORD_OVERHEAD: usize = 12;

/// Replay sanity ceiling: a size field above this is corruption, not a
/// record worth allocating for.
pub const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;

/// Append the bare `key|size|bytes` triple to `buf`.
pub fn put_triple(buf: &mut BytesMut, key: i32, value: &[u8]) {
    buf.put_i32_le(key);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

/// Encode one full AOF record (triple + CRC footer) into a single buffer.
pub fn encode_frame(key: i32, value: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(RECORD_OVERHEAD + value.len());
    put_triple(&mut buf, key, value);
    let crc = crc32c(0, &buf);
    buf.put_u32_le(crc);
    buf
}

/// Streaming AOF reader. Yields `(key, value)` per record; distinguishes a
/// clean EOF (record boundary) from a torn tail or CRC mismatch, both of
/// which are terminal corruption.
pub struct RecordReader<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        RecordReader { inner, offset: 0 }
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn corrupt(&self, what: &str) -> PersistError {
        PersistError::Corruption(format!("AOF record at offset {:#x}: {}", self.offset, what))
    }

    /// Fill `buf` completely, or report how many bytes were available.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, PersistError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PersistError::Io(e)),
            }
        }
        Ok(filled)
    }

    /// Next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<(i32, Vec<u8>)>, PersistError> {
        let mut key_buf = [0u8; 4];
        match self.read_full(&mut key_buf)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(self.corrupt("truncated key")),
        }
        let key = i32::from_le_bytes(key_buf);

        let mut size_buf = [0u8; 4];
        if self.read_full(&mut size_buf)? != 4 {
            return Err(self.corrupt("truncated size"));
        }
        let size = u32::from_le_bytes(size_buf) as usize;
        if size > MAX_VALUE_LEN {
            return Err(self.corrupt("implausible record size"));
        }

        let mut value = vec![0u8; size];
        if self.read_full(&mut value)? != size {
            return Err(self.corrupt("truncated value"));
        }

        let mut crc_buf = [0u8; 4];
        if self.read_full(&mut crc_buf)? != 4 {
            return Err(self.corrupt("truncated checksum"));
        }
        let crc_file = u32::from_le_bytes(crc_buf);

        let mut crc = crc32c(0, &key_buf);
        crc = crc32c(crc, &size_buf);
        crc = crc32c(crc, &value);
        if crc != crc_file {
            return Err(self.corrupt("checksum mismatch"));
        }

        self.offset += (RECORD_OVERHEAD + size) as u64;
        Ok(Some((key, value)))
    }
}
