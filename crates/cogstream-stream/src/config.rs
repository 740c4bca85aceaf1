//! Stream and cache configuration.

use serde::{Deserialize, Serialize};

use crate::{Result, StreamError};

/// Default cache block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Default cache capacity (64 MiB).
pub const DEFAULT_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default upper bound on a single backend fetch (16 MiB).
pub const DEFAULT_MAX_FETCH: u32 = 16 * 1024 * 1024;

/// Default number of header bytes fetched when a stream opens (16 KiB).
pub const DEFAULT_HEADER_PREFETCH: u32 = 16 * 1024;

/// Block cache settings for a [`CachingStream`](crate::CachingStream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size of one cache block in bytes.
    pub block_size: u32,
    /// Resident bytes above which least-recently-used blocks are evicted.
    pub capacity_bytes: u64,
    /// Largest merged fetch for contiguous missing blocks.
    pub max_fetch_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            capacity_bytes: DEFAULT_CACHE_CAPACITY,
            max_fetch_size: DEFAULT_MAX_FETCH,
        }
    }
}

impl CacheConfig {
    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(StreamError::invalid_config("block_size must be positive"));
        }
        if self.max_fetch_size < self.block_size {
            return Err(StreamError::invalid_config(format!(
                "max_fetch_size {} is smaller than block_size {}",
                self.max_fetch_size, self.block_size
            )));
        }
        Ok(())
    }

    /// Number of blocks a single merged fetch may cover.
    pub fn blocks_per_fetch(&self) -> u64 {
        (self.max_fetch_size / self.block_size.max(1)).max(1) as u64
    }
}

/// Which stream implementation to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Fetch on demand, no retained cache.
    Default,
    /// Block-aligned retained cache with fetch deduplication.
    #[default]
    Caching,
}

/// Settings for opening a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream implementation.
    pub kind: StreamKind,
    /// Largest single backend fetch issued by a default stream.
    pub max_single_fetch: u32,
    /// Bytes fetched from the start of the object when the stream opens. Zero disables it.
    pub header_prefetch: u32,
    /// Block cache settings, used by caching streams.
    pub cache: CacheConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            kind: StreamKind::default(),
            max_single_fetch: DEFAULT_MAX_FETCH,
            header_prefetch: DEFAULT_HEADER_PREFETCH,
            cache: CacheConfig::default(),
        }
    }
}

impl StreamConfig {
    /// A default (uncached) stream configuration.
    pub fn uncached() -> Self {
        Self {
            kind: StreamKind::Default,
            ..Self::default()
        }
    }

    /// Parse a configuration from YAML text.
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_single_fetch == 0 {
            return Err(StreamError::invalid_config("max_single_fetch must be positive"));
        }
        self.cache.validate()
    }
}
