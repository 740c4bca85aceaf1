//! Metric declarations for the cogstream access layer.
//!
//! Every metric emitted by the range readers, the caching stream and the
//! reader facade is declared once in [`metric_defs`]. Emitting code refers
//! to the constant's `name`, so names never drift from what
//! [`describe_metrics`] registers.
//!
//! All metrics carry the [`MetricLabels`] of the object they measure
//! (`backend` and `object`); a few add one more label, such as the failure
//! class.
//!
//! # Example
//!
//! ```rust,ignore
//! use cogstream_metrics::{describe_metrics, metric_defs, MetricLabels};
//!
//! describe_metrics();
//!
//! let labels = MetricLabels::new("http", "https://example.com/scene.tif");
//! metrics::counter!(metric_defs::RANGE_REQUESTS.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Label keys carried by every metric.
pub const OBJECT_LABELS: [&str; 2] = ["backend", "object"];

/// How a metric is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrument {
    /// Monotonic count.
    Counter,
    /// Current level.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

/// Layer of the access stack a metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Backend range requests.
    Range,
    /// Block cache of a caching stream.
    Cache,
    /// Region reads through the reader facade.
    Reader,
}

impl Layer {
    /// Name segment used after the `cogstream.` prefix.
    pub const fn segment(self) -> &'static str {
        match self {
            Layer::Range => "range",
            Layer::Cache => "cache",
            Layer::Reader => "reader",
        }
    }
}

/// One declared metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Full metric name, `cogstream.<layer>.<measure>`.
    pub name: &'static str,
    /// Layer emitting the metric.
    pub layer: Layer,
    /// Recording instrument.
    pub instrument: Instrument,
    /// Unit of the recorded values.
    pub unit: Unit,
    /// Text registered with the recorder.
    pub help: &'static str,
    /// Label added on top of [`OBJECT_LABELS`], if any.
    pub extra_label: Option<&'static str>,
}

impl Metric {
    const fn declare(
        name: &'static str,
        layer: Layer,
        instrument: Instrument,
        unit: Unit,
        help: &'static str,
    ) -> Self {
        Self {
            name,
            layer,
            instrument,
            unit,
            help,
            extra_label: None,
        }
    }

    const fn labelled_by(mut self, key: &'static str) -> Self {
        self.extra_label = Some(key);
        self
    }

    /// Every label key this metric is emitted with.
    pub fn label_keys(&self) -> Vec<&'static str> {
        OBJECT_LABELS.iter().copied().chain(self.extra_label).collect()
    }

    /// Register the unit and help text with the installed recorder.
    pub fn describe(&self) {
        let (name, unit, help) = (self.name, self.unit, self.help);
        match self.instrument {
            Instrument::Counter => describe_counter!(name, unit, help),
            Instrument::Gauge => describe_gauge!(name, unit, help),
            Instrument::Histogram => describe_histogram!(name, unit, help),
        }
    }
}

/// Every metric the access layer emits.
pub mod metric_defs {
    use super::{Instrument, Layer, Metric, Unit};

    use Instrument::{Counter, Gauge, Histogram};

    /// Backend range requests issued, including retries.
    pub const RANGE_REQUESTS: Metric = Metric::declare(
        "cogstream.range.requests",
        Layer::Range,
        Counter,
        Unit::Count,
        "Range requests issued to the storage backend",
    );

    /// Payload bytes returned by successful range requests.
    pub const RANGE_BYTES: Metric = Metric::declare(
        "cogstream.range.bytes",
        Layer::Range,
        Counter,
        Unit::Bytes,
        "Bytes returned by successful range requests",
    );

    /// Attempts that failed transiently and were retried.
    pub const RANGE_RETRIES: Metric = Metric::declare(
        "cogstream.range.retries",
        Layer::Range,
        Counter,
        Unit::Count,
        "Range requests retried after a transient failure",
    );

    /// Range reads surfaced to the caller as errors, by class
    /// (`transient` or `permanent`).
    pub const RANGE_FAILURES: Metric = Metric::declare(
        "cogstream.range.failures",
        Layer::Range,
        Counter,
        Unit::Count,
        "Range reads that failed after local retries",
    )
    .labelled_by("class");

    /// Wall-clock latency of a single backend request.
    pub const RANGE_LATENCY: Metric = Metric::declare(
        "cogstream.range.latency_ms",
        Layer::Range,
        Histogram,
        Unit::Milliseconds,
        "Latency of a single backend range request",
    );

    pub const CACHE_HITS: Metric = Metric::declare(
        "cogstream.cache.hits",
        Layer::Cache,
        Counter,
        Unit::Count,
        "Cache blocks served without a backend fetch",
    );

    pub const CACHE_MISSES: Metric = Metric::declare(
        "cogstream.cache.misses",
        Layer::Cache,
        Counter,
        Unit::Count,
        "Cache blocks fetched from the backend",
    );

    /// Blocks a caller waited for because another caller was fetching them.
    pub const CACHE_DEDUP_WAITS: Metric = Metric::declare(
        "cogstream.cache.dedup_waits",
        Layer::Cache,
        Counter,
        Unit::Count,
        "Waits on another caller's in-flight block fetch",
    );

    pub const CACHE_EVICTIONS: Metric = Metric::declare(
        "cogstream.cache.evictions",
        Layer::Cache,
        Counter,
        Unit::Count,
        "Cache blocks evicted to stay within capacity",
    );

    pub const CACHE_RESIDENT_BYTES: Metric = Metric::declare(
        "cogstream.cache.resident_bytes",
        Layer::Cache,
        Gauge,
        Unit::Bytes,
        "Bytes currently retained by the block cache",
    );

    pub const TILES_DECODED: Metric = Metric::declare(
        "cogstream.reader.tiles_decoded",
        Layer::Reader,
        Counter,
        Unit::Count,
        "Tiles decoded and composited into a region",
    );

    /// Tiles whose decode or compositing failed, by tile error policy
    /// (`abort` or `skip`).
    pub const TILE_FAILURES: Metric = Metric::declare(
        "cogstream.reader.tile_failures",
        Layer::Reader,
        Counter,
        Unit::Count,
        "Tiles that failed to decode or composite",
    )
    .labelled_by("policy");

    /// All metrics, for bulk registration.
    pub const ALL: &[&Metric] = &[
        &RANGE_REQUESTS,
        &RANGE_BYTES,
        &RANGE_RETRIES,
        &RANGE_FAILURES,
        &RANGE_LATENCY,
        &CACHE_HITS,
        &CACHE_MISSES,
        &CACHE_DEDUP_WAITS,
        &CACHE_EVICTIONS,
        &CACHE_RESIDENT_BYTES,
        &TILES_DECODED,
        &TILE_FAILURES,
    ];
}

/// Labels identifying which remote object a metric belongs to.
///
/// ```rust
/// use cogstream_metrics::MetricLabels;
///
/// let labels = MetricLabels::new("s3", "s3://bucket/scene.tif");
/// let with_class = labels.with(&[("class", "permanent".to_string())]);
/// assert_eq!(with_class.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Backend name (file, http, s3, azure, gcs, memory).
    pub backend: String,
    /// Object URL or path, never credentials.
    pub object: String,
}

impl MetricLabels {
    pub fn new(backend: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            object: object.into(),
        }
    }

    /// The `backend` and `object` pairs, in [`OBJECT_LABELS`] order.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let [backend, object] = OBJECT_LABELS;
        vec![(backend, self.backend.clone()), (object, self.object.clone())]
    }

    /// The object labels followed by `extra`.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Register every metric's unit and help text with the installed recorder.
///
/// Call once at startup, after the recorder is installed.
pub fn describe_metrics() {
    metric_defs::ALL.iter().for_each(|metric| metric.describe());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        let labels = MetricLabels::new("http", "https://example.com/a.tif");
        assert_eq!(
            labels.to_labels(),
            vec![
                ("backend", "http".to_string()),
                ("object", "https://example.com/a.tif".to_string()),
            ]
        );
    }

    #[test]
    fn test_with_extra_labels() {
        let labels = MetricLabels::new("file", "/tmp/a.tif");
        let extended = labels.with(&[("policy", "skip".to_string())]);
        assert_eq!(extended.len(), 3);
        assert_eq!(extended[2], ("policy", "skip".to_string()));
    }

    #[test]
    fn test_label_keys_follow_declaration() {
        assert_eq!(metric_defs::RANGE_REQUESTS.label_keys(), vec!["backend", "object"]);
        assert_eq!(
            metric_defs::RANGE_FAILURES.label_keys(),
            vec!["backend", "object", "class"]
        );
        assert_eq!(
            metric_defs::TILE_FAILURES.label_keys(),
            vec!["backend", "object", "policy"]
        );
    }

    #[test]
    fn test_names_match_layer() {
        for metric in metric_defs::ALL {
            let prefix = format!("cogstream.{}.", metric.layer.segment());
            assert!(metric.name.starts_with(&prefix), "{} not under {prefix}", metric.name);
            assert!(!metric.help.is_empty(), "{} has no help text", metric.name);
        }
    }

    #[test]
    fn test_instruments() {
        assert_eq!(metric_defs::RANGE_REQUESTS.instrument, Instrument::Counter);
        assert_eq!(metric_defs::RANGE_LATENCY.instrument, Instrument::Histogram);
        assert_eq!(metric_defs::RANGE_LATENCY.unit, Unit::Milliseconds);
        assert_eq!(metric_defs::CACHE_RESIDENT_BYTES.instrument, Instrument::Gauge);
    }

    #[test]
    fn test_all_metrics_unique() {
        let mut names: Vec<_> = metric_defs::ALL.iter().map(|m| m.name).collect();
        let count = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), count);
        assert_eq!(count, 12);
    }
}
