//! Stream backed by a block cache with fetch deduplication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cogstream_metrics::MetricLabels;
use cogstream_range::{BackendKind, RangeError, RangeReader, ReaderStatsSnapshot};
use tracing::debug;

use crate::cache::{BlockCache, CacheBlock, InFlight, Lookup};
use crate::stream::check_bounds;
use crate::{CacheStatsSnapshot, RangeStream, Result, StreamConfig, StreamError};

/// Claims owned by one read. Any claim still unresolved when this drops is
/// failed so its waiters never hang.
struct Claims<'a> {
    cache: &'a BlockCache,
    pending: Vec<(u64, Arc<InFlight>)>,
}

impl<'a> Claims<'a> {
    fn new(cache: &'a BlockCache) -> Self {
        Self {
            cache,
            pending: Vec::new(),
        }
    }

    fn fail_all(&mut self, err: &Arc<RangeError>) {
        for (index, flight) in self.pending.drain(..) {
            self.cache.fail(index, &flight, Arc::clone(err));
        }
    }
}

impl Drop for Claims<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.fail_all(&Arc::new(RangeError::Closed));
        }
    }
}

/// A stream that keeps fetched blocks and shares fetches between callers.
///
/// A read is resolved block by block. Published blocks are copied directly;
/// contiguous runs of missing blocks are fetched with one range request and
/// split into blocks; blocks another caller is already fetching are awaited
/// rather than fetched again.
#[derive(Debug)]
pub struct CachingStream {
    reader: Box<dyn RangeReader>,
    cache: BlockCache,
    length: u64,
    blocks_per_fetch: u64,
    closed: AtomicBool,
}

impl CachingStream {
    /// Open a caching stream over `reader`, prefetching the header blocks.
    pub fn open(reader: Box<dyn RangeReader>, config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        let length = reader.length()?;
        let labels = MetricLabels::new(reader.backend().as_str(), reader.location());
        let stream = Self {
            cache: BlockCache::new(
                config.cache.block_size,
                config.cache.capacity_bytes,
                length,
                labels,
            ),
            reader,
            length,
            blocks_per_fetch: config.cache.blocks_per_fetch(),
            closed: AtomicBool::new(false),
        };

        let prefetch = (config.header_prefetch as u64).min(length);
        if prefetch > 0 {
            stream.resolve(0, stream.cache.block_of(prefetch - 1))?;
        }
        debug!(
            location = stream.reader.location(),
            length,
            block_size = config.cache.block_size,
            prefetch,
            "opened caching stream"
        );
        Ok(stream)
    }

    /// The block cache, for inspection.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Fetch one contiguous run of claimed blocks with a single request.
    fn fetch_run(
        &self,
        run: &[(u64, Arc<InFlight>)],
    ) -> std::result::Result<Vec<Arc<CacheBlock>>, RangeError> {
        let (Some((first, _)), Some((last, _))) = (run.first(), run.last()) else {
            return Ok(Vec::new());
        };
        let (start, _) = self.cache.block_span(*first);
        let (last_start, last_len) = self.cache.block_span(*last);
        let len = last_start + last_len - start;

        debug!(location = self.reader.location(), start, len, blocks = run.len(), "fetching blocks");
        self.cache.record_fetch();
        let bytes = self.reader.read_range(start, len as u32)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        if bytes.len() as u64 != len {
            return Err(RangeError::ShortRead {
                offset: start,
                requested: len,
                received: bytes.len() as u64,
            });
        }

        Ok(run
            .iter()
            .map(|(index, flight)| {
                let (block_start, block_len) = self.cache.block_span(*index);
                let from = (block_start - start) as usize;
                let to = from + block_len as usize;
                self.cache.publish(*index, flight, bytes.slice(from..to))
            })
            .collect())
    }

    /// Fetch this caller's claims, merging runs of consecutive indices.
    fn fetch_claims(
        &self,
        claims: &mut Claims<'_>,
        resolved: &mut [Option<Arc<CacheBlock>>],
        first: u64,
    ) -> Result<()> {
        let mut start = 0;
        while start < claims.pending.len() {
            let mut end = start + 1;
            while end < claims.pending.len()
                && claims.pending[end].0 == claims.pending[end - 1].0 + 1
                && ((end - start) as u64) < self.blocks_per_fetch
            {
                end += 1;
            }

            match self.fetch_run(&claims.pending[start..end]) {
                Ok(blocks) => {
                    for block in blocks {
                        let at = (block.index() - first) as usize;
                        resolved[at] = Some(block);
                    }
                }
                Err(err) => {
                    // Earlier runs are published; fail the rest and share the error.
                    claims.pending.drain(..start);
                    let shared = Arc::new(err);
                    claims.fail_all(&shared);
                    return Err(StreamError::Fetch(shared));
                }
            }
            start = end;
        }
        claims.pending.clear();
        Ok(())
    }

    /// Make blocks `first..=last` resident and return them in order.
    fn resolve(&self, first: u64, last: u64) -> Result<Vec<Arc<CacheBlock>>> {
        let count = (last - first + 1) as usize;
        let mut resolved: Vec<Option<Arc<CacheBlock>>> = vec![None; count];

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(StreamError::Closed);
            }

            let mut claims = Claims::new(&self.cache);
            let mut waiting: Option<(u64, Arc<InFlight>)> = None;
            for index in first..=last {
                let slot = &mut resolved[(index - first) as usize];
                if slot.is_some() {
                    continue;
                }
                match self.cache.lookup(index) {
                    Lookup::Hit(block) => *slot = Some(block),
                    Lookup::Claimed(flight) => claims.pending.push((index, flight)),
                    Lookup::Pending(flight) => {
                        // Stop at another caller's fetch; the rest is rescanned once it lands.
                        waiting = Some((index, flight));
                        break;
                    }
                }
            }

            if claims.pending.is_empty() && waiting.is_none() {
                break;
            }
            self.fetch_claims(&mut claims, &mut resolved, first)?;

            if let Some((index, flight)) = waiting {
                self.cache.record_wait();
                let block = flight.wait().map_err(StreamError::Fetch)?;
                resolved[(index - first) as usize] = Some(block);
            }
        }

        self.cache.evict();
        Ok(resolved.into_iter().flatten().collect())
    }
}

impl RangeStream for CachingStream {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        check_bounds(offset, buf.len(), self.length)?;
        if buf.is_empty() {
            return Ok(());
        }

        let end = offset + buf.len() as u64;
        let first = self.cache.block_of(offset);
        let last = self.cache.block_of(end - 1);
        let blocks = self.resolve(first, last)?;

        // Copy invariant: `written` bytes of `buf` are filled and `pos` is
        // the object offset of the next byte, always inside the current block.
        let mut written = 0usize;
        let mut pos = offset;
        for block in &blocks {
            let (block_start, _) = self.cache.block_span(block.index());
            let src_start = (pos - block_start) as usize;
            let take = (block.len().saturating_sub(src_start)).min(buf.len() - written);
            let src_end = src_start + take;
            let src = block.data().get(src_start..src_end).ok_or(StreamError::BlockBounds {
                index: block.index(),
                offset: src_start,
                end: src_end,
                available: block.len(),
            })?;
            buf[written..written + take].copy_from_slice(src);
            written += take;
            pos += take as u64;
        }

        if written != buf.len() {
            return Err(StreamError::BlockBounds {
                index: last,
                offset: written,
                end: buf.len(),
                available: written,
            });
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.close();
        self.cache.close();
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

    fn cache_stats(&self) -> Option<CacheStatsSnapshot> {
        Some(self.cache.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheConfig;
    use cogstream_range::{MemoryRangeReader, RangeRequest, RetryPolicy};
    use std::time::Duration;

    /// Holds every fetched range for a while before returning it.
    #[derive(Debug)]
    struct Delayed(MemoryRangeReader, Duration);

    impl RangeReader for Delayed {
        fn read_range(&self, offset: u64, length: u32) -> cogstream_range::Result<bytes::Bytes> {
            let bytes = self.0.read_range(offset, length)?;
            std::thread::sleep(self.1);
            Ok(bytes)
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
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn config(block_size: u32, capacity_bytes: u64) -> StreamConfig {
        StreamConfig {
            header_prefetch: 0,
            cache: CacheConfig {
                block_size,
                capacity_bytes,
                max_fetch_size: block_size * 64,
            },
            ..StreamConfig::default()
        }
    }

    #[test]
    fn test_missing_blocks_merge_into_one_fetch() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let stream = CachingStream::open(Box::new(reader), &config(100, 10_000)).unwrap();

        let bytes = stream.read_bytes(150, 300).unwrap();
        assert_eq!(&bytes[..], &data(1000)[150..450]);
        assert_eq!(probe.requests(), vec![RangeRequest::new(100, 400)]);
        assert_eq!(stream.cache().stats().resident_blocks, 4);
    }

    #[test]
    fn test_cached_blocks_split_fetches() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let stream = CachingStream::open(Box::new(reader), &config(100, 10_000)).unwrap();

        stream.read_bytes(200, 100).unwrap();
        probe.reset();
        let bytes = stream.read_bytes(0, 500).unwrap();
        assert_eq!(&bytes[..], &data(1000)[..500]);
        assert_eq!(
            probe.requests(),
            vec![RangeRequest::new(0, 200), RangeRequest::new(300, 200)]
        );
    }

    #[test]
    fn test_merged_fetch_respects_max_fetch_size() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let mut cfg = config(100, 10_000);
        cfg.cache.max_fetch_size = 250;
        let stream = CachingStream::open(Box::new(reader), &cfg).unwrap();

        stream.read_bytes(0, 500).unwrap();
        assert_eq!(
            probe.requests(),
            vec![
                RangeRequest::new(0, 200),
                RangeRequest::new(200, 200),
                RangeRequest::new(400, 100),
            ]
        );
    }

    #[test]
    fn test_last_block_is_short() {
        let reader = MemoryRangeReader::new(data(250));
        let stream = CachingStream::open(Box::new(reader), &config(100, 10_000)).unwrap();
        assert_eq!(&stream.read_bytes(190, 60).unwrap()[..], &data(250)[190..250]);
        assert!(matches!(
            stream.read_bytes(240, 20),
            Err(StreamError::Range(RangeError::UnexpectedEof { available: 250, .. }))
        ));
    }

    #[test]
    fn test_header_prefetch_is_one_request() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let cfg = StreamConfig {
            header_prefetch: 150,
            ..config(64, 10_000)
        };
        let stream = CachingStream::open(Box::new(reader), &cfg).unwrap();
        assert_eq!(probe.requests(), vec![RangeRequest::new(0, 192)]);

        stream.read_bytes(10, 140).unwrap();
        assert_eq!(probe.calls(), 1);
    }

    #[test]
    fn test_failed_fetch_is_not_cached() {
        let reader = MemoryRangeReader::new(data(1000)).with_retry(RetryPolicy::none());
        let probe = reader.probe();
        reader.fail_next(RangeError::Status {
            status: 503,
            location: "mem://object".into(),
        });
        let stream = CachingStream::open(Box::new(reader), &config(100, 10_000)).unwrap();

        let err = stream.read_bytes(0, 50).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(stream.cache().stats().resident_blocks, 0);

        assert_eq!(&stream.read_bytes(0, 50).unwrap()[..], &data(1000)[..50]);
        assert_eq!(probe.calls(), 2);
    }

    #[test]
    fn test_close_drops_cache_and_fails_fast() {
        let reader = MemoryRangeReader::new(data(1000));
        let probe = reader.probe();
        let stream = CachingStream::open(Box::new(reader), &config(100, 10_000)).unwrap();
        stream.read_bytes(0, 10).unwrap();
        stream.close();

        assert!(stream.is_closed());
        assert_eq!(stream.cache().stats().resident_bytes, 0);
        assert!(matches!(stream.read_bytes(0, 10), Err(StreamError::Closed)));
        assert_eq!(probe.calls(), 1);
    }

    #[test]
    fn test_fetch_landing_after_close_is_dropped() {
        let reader = Delayed(MemoryRangeReader::new(data(1000)), Duration::from_millis(300));
        let stream = Arc::new(CachingStream::open(Box::new(reader), &config(100, 10_000)).unwrap());

        let reading = {
            let stream = Arc::clone(&stream);
            std::thread::spawn(move || stream.read_bytes(0, 250))
        };
        std::thread::sleep(Duration::from_millis(100));
        stream.close();

        let err = reading.join().unwrap().unwrap_err();
        assert!(matches!(err.range_error(), Some(RangeError::Closed)));
        let stats = stream.cache().stats();
        assert_eq!((stats.resident_bytes, stats.resident_blocks), (0, 0));
        assert!(!stream.cache().contains(0));
    }
}
