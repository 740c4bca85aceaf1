//! Fetch-on-demand stream without a retained cache.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use cogstream_range::{BackendKind, RangeError, RangeReader, ReaderStatsSnapshot};
use tracing::debug;

use crate::stream::check_bounds;
use crate::{RangeStream, Result, StreamConfig, StreamError};

/// A stream that sends every read straight to the range reader.
///
/// Reads larger than `max_single_fetch` are split into sequential
/// sub-fetches. Only the header prefetched at open time is retained; reads
/// falling entirely inside it are served without a backend call.
#[derive(Debug)]
pub struct DefaultStream {
    reader: Box<dyn RangeReader>,
    length: u64,
    max_single_fetch: u32,
    header: Bytes,
    closed: AtomicBool,
}

impl DefaultStream {
    /// Open a stream over `reader`, querying its length and prefetching the header.
    pub fn open(reader: Box<dyn RangeReader>, config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        let length = reader.length()?;
        let prefetch = (config.header_prefetch as u64).min(length) as u32;
        let header = if prefetch > 0 {
            reader.read_range(0, prefetch)?
        } else {
            Bytes::new()
        };
        debug!(
            location = reader.location(),
            length,
            header = header.len(),
            "opened default stream"
        );

        Ok(Self {
            reader,
            length,
            max_single_fetch: config.max_single_fetch,
            header,
            closed: AtomicBool::new(false),
        })
    }
}

impl RangeStream for DefaultStream {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        check_bounds(offset, buf.len(), self.length)?;
        if buf.is_empty() {
            return Ok(());
        }

        let end = offset + buf.len() as u64;
        if end <= self.header.len() as u64 {
            buf.copy_from_slice(&self.header[offset as usize..end as usize]);
            return Ok(());
        }

        let mut filled = 0usize;
        for chunk in buf.chunks_mut(self.max_single_fetch as usize) {
            let at = offset + filled as u64;
            let bytes = self.reader.read_range(at, chunk.len() as u32)?;
            if bytes.len() != chunk.len() {
                return Err(StreamError::Range(RangeError::ShortRead {
                    offset: at,
                    requested: chunk.len() as u64,
                    received: bytes.len() as u64,
                }));
            }
            chunk.copy_from_slice(&bytes);
            filled += chunk.len();
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn backend(&self) -> BackendKind {
        self.reader.backend()
    }

    fn location(&self) -> &str {
        self.reader.location()
    }

    fn reader_stats(&self) -> ReaderStatsSnapshot {
        self.reader.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogstream_range::{MemoryRangeReader, RangeRequest};

    /// Returns half of every requested range.
    #[derive(Debug)]
    struct Truncating(MemoryRangeReader);

    impl RangeReader for Truncating {
        fn read_range(&self, offset: u64, length: u32) -> cogstream_range::Result<Bytes> {
            let bytes = self.0.read_range(offset, length)?;
            Ok(bytes.slice(..bytes.len() / 2))
        }

        fn length(&self) -> cogstream_range::Result<u64> {
            self.0.length()
        }

        fn close(&self) {
            self.0.close()
        }

        fn is_closed(&self) -> bool {
            self.0.is_closed()
        }

        fn backend(&self) -> BackendKind {
            self.0.backend()
        }

        fn location(&self) -> &str {
            self.0.location()
        }

        fn stats(&self) -> ReaderStatsSnapshot {
            self.0.stats()
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn config(max_single_fetch: u32, header_prefetch: u32) -> StreamConfig {
        StreamConfig {
            max_single_fetch,
            header_prefetch,
            ..StreamConfig::uncached()
        }
    }

    #[test]
    fn test_every_read_is_one_fetch() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let stream = DefaultStream::open(Box::new(reader), &config(4096, 0)).unwrap();

        let mut buf = [0u8; 1];
        stream.read_at(5, &mut buf).unwrap();
        stream.read_at(5, &mut buf).unwrap();
        assert_eq!(buf[0], data(1000)[5]);
        assert_eq!(probe.requests(), vec![RangeRequest::new(5, 1); 2]);
    }

    #[test]
    fn test_large_read_is_split() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let stream = DefaultStream::open(Box::new(reader), &config(300, 0)).unwrap();

        let bytes = stream.read_bytes(100, 700).unwrap();
        assert_eq!(&bytes[..], &data(1000)[100..800]);
        assert_eq!(
            probe.requests(),
            vec![
                RangeRequest::new(100, 300),
                RangeRequest::new(400, 300),
                RangeRequest::new(700, 100),
            ]
        );
    }

    #[test]
    fn test_header_reads_are_served_locally() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let stream = DefaultStream::open(Box::new(reader), &config(4096, 64)).unwrap();
        assert_eq!(probe.requests(), vec![RangeRequest::new(0, 64)]);

        assert_eq!(&stream.read_bytes(8, 16).unwrap()[..], &data(1000)[8..24]);
        assert_eq!(probe.calls(), 1);

        // Straddling the header end goes to the backend.
        stream.read_bytes(60, 8).unwrap();
        assert_eq!(probe.calls(), 2);
    }

    #[test]
    fn test_prefetch_clamped_to_object() {
        let reader = MemoryRangeReader::new(data(10));
        let probe = reader.probe();
        DefaultStream::open(Box::new(reader), &config(4096, 16_384)).unwrap();
        assert_eq!(probe.requests(), vec![RangeRequest::new(0, 10)]);
    }

    #[test]
    fn test_missing_object_fails_to_open() {
        let err = DefaultStream::open(
            Box::new(MemoryRangeReader::missing("mem://gone")),
            &config(4096, 0),
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Range(RangeError::NotFound(_))));
    }

    #[test]
    fn test_closed_stream_fails_fast() {
        let reader = MemoryRangeReader::new(data(100));
        let probe = reader.probe();
        let stream = DefaultStream::open(Box::new(reader), &config(4096, 0)).unwrap();
        stream.close();
        assert!(matches!(stream.read_bytes(0, 4), Err(StreamError::Closed)));
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn test_short_backend_read_is_an_error() {
        let reader = Truncating(MemoryRangeReader::new(data(1000)));
        let stream = DefaultStream::open(Box::new(reader), &config(4096, 0)).unwrap();

        let err = stream.read_bytes(0, 100).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Range(RangeError::ShortRead {
                offset: 0,
                requested: 100,
                received: 50,
            })
        ));
        assert!(!err.is_transient());
    }
}
