//! The range reader capability shared by every backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cogstream_metrics::{metric_defs, MetricLabels};

use crate::{BackendKind, ErrorClass, Result};

/// A single contiguous fetch request: `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeRequest {
    /// Start offset within the object.
    pub offset: u64,
    /// Number of bytes to fetch.
    pub length: u32,
}

impl RangeRequest {
    /// Create a new request.
    pub const fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub const fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// Value of an HTTP `Range` header for this request.
    ///
    /// Only meaningful for non-empty requests.
    pub fn http_header(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end() - 1)
    }
}

/// Backend-specific primitive that fetches byte ranges of one remote object.
///
/// Implementations must be safe to call from several threads at once; the
/// tile-decode worker pool shares one reader. Every call blocks the calling
/// thread until the bytes arrive, the retry budget is exhausted, or the
/// reader is closed.
pub trait RangeReader: Send + Sync + std::fmt::Debug {
    /// Fetch exactly `length` bytes starting at `offset`.
    ///
    /// A range reaching past the end of the object fails with
    /// [`RangeError::UnexpectedEof`](crate::RangeError::UnexpectedEof); a
    /// backend answering with fewer bytes fails with
    /// [`RangeError::ShortRead`](crate::RangeError::ShortRead). Neither is
    /// ever padded or truncated silently.
    fn read_range(&self, offset: u64, length: u32) -> Result<Bytes>;

    /// Fetch several ranges, returning them in request order.
    fn read_ranges(&self, requests: &[RangeRequest]) -> Result<Vec<Bytes>> {
        requests
            .iter()
            .map(|r| self.read_range(r.offset, r.length))
            .collect()
    }

    /// Total size of the remote object, fetched once and remembered.
    fn length(&self) -> Result<u64>;

    /// Release backend resources; every later call fails with `Closed`.
    fn close(&self);

    /// Whether [`close`](RangeReader::close) has been called.
    fn is_closed(&self) -> bool;

    /// Which backend serves this reader.
    fn backend(&self) -> BackendKind;

    /// Object identity for logs and metrics. Never contains credentials.
    fn location(&self) -> &str;

    /// Request statistics for this reader.
    fn stats(&self) -> ReaderStatsSnapshot;
}

impl<R: RangeReader + ?Sized> RangeReader for Box<R> {
    fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        (**self).read_range(offset, length)
    }

    fn read_ranges(&self, requests: &[RangeRequest]) -> Result<Vec<Bytes>> {
        (**self).read_ranges(requests)
    }

    fn length(&self) -> Result<u64> {
        (**self).length()
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn backend(&self) -> BackendKind {
        (**self).backend()
    }

    fn location(&self) -> &str {
        (**self).location()
    }

    fn stats(&self) -> ReaderStatsSnapshot {
        (**self).stats()
    }
}

/// Per-reader request counters.
#[derive(Debug, Default)]
pub struct ReaderStats {
    requests: AtomicU64,
    bytes: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`ReaderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStatsSnapshot {
    /// Backend requests issued, including retries.
    pub requests: u64,
    /// Payload bytes received.
    pub bytes: u64,
    /// Attempts retried after a transient failure.
    pub retries: u64,
    /// Reads surfaced to the caller as errors.
    pub failures: u64,
}

impl ReaderStats {
    /// Snapshot the counters.
    pub fn snapshot(&self) -> ReaderStatsSnapshot {
        ReaderStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Statistics plus metric labels, shared by a backend and its retry loop.
#[derive(Debug, Clone)]
pub struct Telemetry {
    labels: MetricLabels,
    stats: Arc<ReaderStats>,
}

impl Telemetry {
    /// Create telemetry for a backend reading `object`.
    pub fn new(backend: BackendKind, object: impl Into<String>) -> Self {
        Self {
            labels: MetricLabels::new(backend.as_str(), object),
            stats: Arc::new(ReaderStats::default()),
        }
    }

    /// Metric labels for this reader.
    pub fn labels(&self) -> &MetricLabels {
        &self.labels
    }

    /// Snapshot of the counters.
    pub fn snapshot(&self) -> ReaderStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn request(&self, latency: Duration) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let labels = self.labels.to_labels();
        metrics::counter!(metric_defs::RANGE_REQUESTS.name, &labels).increment(1);
        metrics::histogram!(metric_defs::RANGE_LATENCY.name, &labels)
            .record(latency.as_secs_f64() * 1000.0);
    }

    pub(crate) fn bytes(&self, count: usize) {
        self.stats.bytes.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!(metric_defs::RANGE_BYTES.name, &self.labels.to_labels())
            .increment(count as u64);
    }

    pub(crate) fn retry(&self) {
        self.stats.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::RANGE_RETRIES.name, &self.labels.to_labels()).increment(1);
    }

    pub(crate) fn failure(&self, class: ErrorClass) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        let labels = self.labels.with(&[("class", class.as_str().to_string())]);
        metrics::counter!(metric_defs::RANGE_FAILURES.name, &labels).increment(1);
    }
}
