//! Block cache with per-block fetch claims and LRU eviction.
//!
//! Every block index maps to either a published, immutable block or a
//! pending fetch claimed by exactly one caller. Other callers wanting the
//! same block wait on the claim instead of fetching it again. Failed
//! fetches remove their claim so a later caller can try again; nothing is
//! ever published for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cogstream_metrics::{metric_defs, MetricLabels};
use cogstream_range::RangeError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};

/// One published block of the object. Immutable once created.
#[derive(Debug)]
pub struct CacheBlock {
    index: u64,
    data: Bytes,
    last_access: AtomicU64,
}

impl CacheBlock {
    /// Block index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Block contents. Shorter than the block size only for the final block.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

type FetchOutcome = Result<Arc<CacheBlock>, Arc<RangeError>>;

/// A fetch claimed by one caller and awaited by others.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    outcome: Mutex<Option<FetchOutcome>>,
    done: Condvar,
}

impl InFlight {
    /// Block until the claiming caller publishes or fails the block.
    pub(crate) fn wait(&self) -> FetchOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut outcome);
        }
    }

    fn finish(&self, result: FetchOutcome) {
        *self.outcome.lock() = Some(result);
        self.done.notify_all();
    }
}

#[derive(Debug)]
enum Slot {
    Ready(Arc<CacheBlock>),
    Pending(Arc<InFlight>),
}

/// Result of looking up one block.
#[derive(Debug)]
pub(crate) enum Lookup {
    /// Published block.
    Hit(Arc<CacheBlock>),
    /// Another caller is fetching it.
    Pending(Arc<InFlight>),
    /// This caller now owns the fetch and must publish or fail it.
    Claimed(Arc<InFlight>),
}

/// Per-cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    dedup_waits: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Block lookups served from a published block.
    pub hits: u64,
    /// Blocks claimed for fetching.
    pub misses: u64,
    /// Backend fetches issued (one may cover several blocks).
    pub fetches: u64,
    /// Times a caller waited on another caller's fetch.
    pub dedup_waits: u64,
    /// Blocks evicted.
    pub evictions: u64,
    /// Bytes currently held by published blocks.
    pub resident_bytes: u64,
    /// Published blocks currently held.
    pub resident_blocks: u64,
}

/// Block-aligned cache for one object.
#[derive(Debug)]
pub struct BlockCache {
    block_size: u64,
    object_len: u64,
    capacity_bytes: u64,
    slots: DashMap<u64, Slot>,
    resident_bytes: AtomicU64,
    resident_blocks: AtomicU64,
    clock: AtomicU64,
    eviction: Mutex<()>,
    closed: RwLock<bool>,
    stats: CacheStats,
    labels: MetricLabels,
}

impl BlockCache {
    /// Create an empty cache over an object of `object_len` bytes.
    pub fn new(block_size: u32, capacity_bytes: u64, object_len: u64, labels: MetricLabels) -> Self {
        Self {
            block_size: block_size.max(1) as u64,
            object_len,
            capacity_bytes,
            slots: DashMap::new(),
            resident_bytes: AtomicU64::new(0),
            resident_blocks: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            eviction: Mutex::new(()),
            closed: RwLock::new(false),
            stats: CacheStats::default(),
            labels,
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Index of the block containing `offset`.
    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    /// Byte span `(start, len)` of block `index`, clipped to the object end.
    pub fn block_span(&self, index: u64) -> (u64, u64) {
        let start = index * self.block_size;
        let end = (start + self.block_size).min(self.object_len);
        (start, end.saturating_sub(start))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up `index`, claiming it for this caller if nobody holds it.
    pub(crate) fn lookup(&self, index: u64) -> Lookup {
        let lookup = match self.slots.entry(index) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(block) => {
                    block.last_access.store(self.tick(), Ordering::Relaxed);
                    Lookup::Hit(Arc::clone(block))
                }
                Slot::Pending(flight) => Lookup::Pending(Arc::clone(flight)),
            },
            Entry::Vacant(entry) => {
                let flight = Arc::new(InFlight::default());
                entry.insert(Slot::Pending(Arc::clone(&flight)));
                Lookup::Claimed(flight)
            }
        };

        match &lookup {
            Lookup::Hit(_) => {
                trace!(index, "cache hit");
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric_defs::CACHE_HITS.name, &self.labels.to_labels()).increment(1);
            }
            Lookup::Claimed(_) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric_defs::CACHE_MISSES.name, &self.labels.to_labels())
                    .increment(1);
            }
            Lookup::Pending(_) => {}
        }
        lookup
    }

    /// Publish the fetched bytes of a claimed block and wake its waiters.
    ///
    /// After [`close`](Self::close) the block is handed to the waiters but
    /// not retained.
    pub(crate) fn publish(&self, index: u64, flight: &InFlight, data: Bytes) -> Arc<CacheBlock> {
        let len = data.len() as u64;
        let block = Arc::new(CacheBlock {
            index,
            data,
            last_access: AtomicU64::new(self.tick()),
        });
        let closed = self.closed.read();
        if !*closed {
            self.slots.insert(index, Slot::Ready(Arc::clone(&block)));
            self.resident_bytes.fetch_add(len, Ordering::Relaxed);
            self.resident_blocks.fetch_add(1, Ordering::Relaxed);
        }
        drop(closed);
        flight.finish(Ok(Arc::clone(&block)));
        self.report_resident();
        block
    }

    /// Drop a failed claim and hand the error to its waiters.
    pub(crate) fn fail(&self, index: u64, flight: &Arc<InFlight>, err: Arc<RangeError>) {
        self.slots.remove_if(&index, |_, slot| {
            matches!(slot, Slot::Pending(pending) if Arc::ptr_eq(pending, flight))
        });
        flight.finish(Err(err));
    }

    /// Count a wait on another caller's fetch.
    pub(crate) fn record_wait(&self) {
        self.stats.dedup_waits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::CACHE_DEDUP_WAITS.name, &self.labels.to_labels())
            .increment(1);
    }

    /// Count one backend fetch.
    pub(crate) fn record_fetch(&self) {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict least-recently-used blocks until resident bytes fit the capacity.
    ///
    /// Pending claims and blocks some caller still holds are never evicted.
    /// If another thread is already evicting, this returns immediately.
    pub fn evict(&self) {
        if self.resident_bytes.load(Ordering::Relaxed) <= self.capacity_bytes {
            return;
        }
        let Some(_guard) = self.eviction.try_lock() else {
            return;
        };

        let mut candidates: Vec<(u64, u64)> = self
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(block) => Some((block.last_access.load(Ordering::Relaxed), *entry.key())),
                Slot::Pending(_) => None,
            })
            .collect();
        candidates.sort_unstable();

        for (_, index) in candidates {
            if self.resident_bytes.load(Ordering::Relaxed) <= self.capacity_bytes {
                break;
            }
            let removed = self.slots.remove_if(&index, |_, slot| {
                matches!(slot, Slot::Ready(block) if Arc::strong_count(block) == 1)
            });
            if let Some((_, Slot::Ready(block))) = removed {
                self.resident_bytes.fetch_sub(block.len() as u64, Ordering::Relaxed);
                self.resident_blocks.fetch_sub(1, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric_defs::CACHE_EVICTIONS.name, &self.labels.to_labels())
                    .increment(1);
                debug!(index, "evicted cache block");
            }
        }
        self.report_resident();
    }

    /// Drop every published block and pending claim, and stop retaining
    /// blocks published afterwards.
    pub fn close(&self) {
        let mut closed = self.closed.write();
        *closed = true;
        self.slots.clear();
        self.resident_bytes.store(0, Ordering::Relaxed);
        self.resident_blocks.store(0, Ordering::Relaxed);
        self.report_resident();
    }

    /// Whether a published block is held for `index`.
    pub fn contains(&self, index: u64) -> bool {
        self.slots
            .get(&index)
            .is_some_and(|slot| matches!(*slot, Slot::Ready(_)))
    }

    fn report_resident(&self) {
        metrics::gauge!(metric_defs::CACHE_RESIDENT_BYTES.name, &self.labels.to_labels())
            .set(self.resident_bytes.load(Ordering::Relaxed) as f64);
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            dedup_waits: self.stats.dedup_waits.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            resident_bytes: self.resident_bytes.load(Ordering::Relaxed),
            resident_blocks: self.resident_blocks.load(Ordering::Relaxed),
        }
    }
}
