//! In-memory range reader with request recording and failure injection.
//!
//! Used as a stand-in backend when testing streams, parsers and the reader
//! facade without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    BackendKind, RangeError, RangeReader, RangeRequest, ReaderStatsSnapshot, Result, RetryPolicy,
    Telemetry,
};

#[derive(Debug, Default)]
struct Recorder {
    requests: Mutex<Vec<RangeRequest>>,
    length_calls: Mutex<usize>,
    failures: Mutex<VecDeque<RangeError>>,
}

/// Shared view of the calls a [`MemoryRangeReader`] received.
///
/// Stays valid after the reader has been moved into a stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe {
    recorder: Arc<Recorder>,
}

impl MemoryProbe {
    /// Number of backend fetch attempts, including failed ones.
    pub fn calls(&self) -> usize {
        self.recorder.requests.lock().len()
    }

    /// Every fetch attempt in the order received.
    pub fn requests(&self) -> Vec<RangeRequest> {
        self.recorder.requests.lock().clone()
    }

    /// Number of times the object length was queried from the backend.
    pub fn length_calls(&self) -> usize {
        *self.recorder.length_calls.lock()
    }

    /// Make the next fetch attempt fail with `err`. Failures queue up.
    pub fn fail_next(&self, err: RangeError) {
        self.recorder.failures.lock().push_back(err);
    }

    /// Forget recorded calls.
    pub fn reset(&self) {
        self.recorder.requests.lock().clear();
        *self.recorder.length_calls.lock() = 0;
    }
}

/// A [`RangeReader`] serving an in-memory object.
#[derive(Debug)]
pub struct MemoryRangeReader {
    location: String,
    data: Bytes,
    retry: RetryPolicy,
    latency: Duration,
    missing: bool,
    recorder: Arc<Recorder>,
    telemetry: Telemetry,
    closed: AtomicBool,
}

impl MemoryRangeReader {
    /// Serve `data` as an object named `mem://object`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::named("mem://object", data)
    }

    /// Serve `data` under the given location name.
    pub fn named(location: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let location = location.into();
        Self {
            telemetry: Telemetry::new(BackendKind::Memory, location.clone()),
            location,
            data: data.into(),
            retry: RetryPolicy::immediate(3),
            latency: Duration::ZERO,
            missing: false,
            recorder: Arc::new(Recorder::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// A reader for an object that does not exist.
    pub fn missing(location: impl Into<String>) -> Self {
        let mut reader = Self::named(location, Bytes::new());
        reader.missing = true;
        reader
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sleep this long inside every fetch, widening race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next fetch attempt fail with `err`. Failures queue up.
    pub fn fail_next(&self, err: RangeError) {
        self.recorder.failures.lock().push_back(err);
    }

    /// Handle for inspecting calls after the reader has been moved.
    pub fn probe(&self) -> MemoryProbe {
        MemoryProbe {
            recorder: Arc::clone(&self.recorder),
        }
    }

    fn attempt(&self, offset: u64, length: u32) -> Result<Bytes> {
        self.recorder
            .requests
            .lock()
            .push(RangeRequest::new(offset, length));
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if let Some(err) = self.recorder.failures.lock().pop_front() {
            return Err(err);
        }
        if self.missing {
            return Err(RangeError::NotFound(self.location.clone()));
        }

        let available = self.data.len() as u64;
        let end = offset + length as u64;
        if end > available {
            return Err(RangeError::UnexpectedEof {
                offset,
                requested: length as u64,
                available,
            });
        }
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

impl RangeReader for MemoryRangeReader {
    fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        let bytes = self
            .retry
            .execute(&self.location, &self.closed, &self.telemetry, |_| {
                self.attempt(offset, length)
            })?;
        self.telemetry.bytes(bytes.len());
        Ok(bytes)
    }

    fn length(&self) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        *self.recorder.length_calls.lock() += 1;
        if self.missing {
            return Err(RangeError::NotFound(self.location.clone()));
        }
        Ok(self.data.len() as u64)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn stats(&self) -> ReaderStatsSnapshot {
        self.telemetry.snapshot()
    }
}
