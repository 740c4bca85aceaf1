//! The seek/read contract shared by both stream variants.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use bytes::{Bytes, BytesMut};
use cogstream_range::{BackendKind, RangeError, ReaderStatsSnapshot};

use crate::{CacheStatsSnapshot, Result, StreamError};

/// A read-only view of one remote object with positional reads.
///
/// Reads take `&self` so worker threads can share one stream; each caller
/// keeps its own position in a [`StreamCursor`].
pub trait RangeStream: Send + Sync + fmt::Debug {
    /// Fill `buf` with the bytes at `[offset, offset + buf.len())`.
    ///
    /// Reading past the end of the object fails with
    /// [`RangeError::UnexpectedEof`]; partial reads never happen.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read `len` bytes at `offset` into a new buffer.
    fn read_bytes(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        self.read_at(offset, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Total object length.
    fn length(&self) -> u64;

    /// Close the stream and its range reader. Later reads fail with `Closed`.
    fn close(&self);

    /// Whether the stream has been closed.
    fn is_closed(&self) -> bool;

    /// Backend serving the underlying reader.
    fn backend(&self) -> BackendKind;

    /// Object location for logs.
    fn location(&self) -> &str;

    /// Request statistics of the underlying reader.
    fn reader_stats(&self) -> ReaderStatsSnapshot;

    /// Cache statistics, for streams that keep a cache.
    fn cache_stats(&self) -> Option<CacheStatsSnapshot> {
        None
    }
}

/// Fail with `UnexpectedEof` when `[offset, offset + len)` leaves the object.
pub(crate) fn check_bounds(offset: u64, len: usize, length: u64) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= length => Ok(()),
        _ => Err(StreamError::Range(RangeError::UnexpectedEof {
            offset,
            requested: len as u64,
            available: length,
        })),
    }
}

/// Current logical offset plus the lowest offset still reachable by seeking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPosition {
    /// Offset of the next read.
    pub current: u64,
    /// Seeks below this offset fail. Never decreases.
    pub floor: u64,
}

/// A seek/read cursor over a shared stream.
#[derive(Debug, Clone)]
pub struct StreamCursor<'a> {
    stream: &'a dyn RangeStream,
    position: StreamPosition,
}

impl<'a> StreamCursor<'a> {
    /// Cursor at offset zero.
    pub fn new(stream: &'a dyn RangeStream) -> Self {
        Self {
            stream,
            position: StreamPosition::default(),
        }
    }

    /// The stream being read.
    pub fn stream(&self) -> &'a dyn RangeStream {
        self.stream
    }

    /// Current position and floor.
    pub fn position(&self) -> StreamPosition {
        self.position
    }

    /// Move to `pos`. Only updates the position; nothing is fetched.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        if pos < self.position.floor {
            return Err(StreamError::SeekBelowFloor {
                position: pos,
                floor: self.position.floor,
            });
        }
        self.position.current = pos;
        Ok(())
    }

    /// Fill `buf` from the current position and advance past it.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_at(self.position.current, buf)?;
        self.position.current += buf.len() as u64;
        Ok(())
    }

    /// Read `len` bytes from the current position and advance past them.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        let bytes = self.stream.read_bytes(self.position.current, len)?;
        self.position.current += len as u64;
        Ok(bytes)
    }

    /// Declare that nothing before `pos` will be read again.
    ///
    /// The floor only moves forward and never past the current position.
    pub fn flush_before(&mut self, pos: u64) {
        let pos = pos.min(self.position.current);
        self.position.floor = self.position.floor.max(pos);
    }
}

impl Read for StreamCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.stream.length().saturating_sub(self.position.current);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.read_fully(&mut buf[..n])?;
        Ok(n)
    }
}

impl Seek for StreamCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.stream.length().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.current.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative or overflowing offset")
        })?;
        self.seek_to(target)?;
        Ok(target)
    }
}
