//! Sequential streams over a [`RangeReader`](cogstream_range::RangeReader).
//!
//! Two variants implement [`RangeStream`]:
//!
//! - [`DefaultStream`] sends every read to the backend and keeps nothing
//!   but the prefetched header.
//! - [`CachingStream`] keeps fixed-size blocks in a [`BlockCache`], merges
//!   contiguous missing blocks into one fetch and makes concurrent callers
//!   wait on a single in-flight fetch per block.
//!
//! Reads are positional and take `&self`; [`StreamCursor`] adds the
//! seek/read contract and `std::io::{Read, Seek}` on top.

mod cache;
mod caching;
mod config;
mod default;
mod error;
mod stream;

pub use cache::{BlockCache, CacheBlock, CacheStats, CacheStatsSnapshot};
pub use caching::CachingStream;
pub use config::{
    CacheConfig, StreamConfig, StreamKind, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_CAPACITY,
    DEFAULT_HEADER_PREFETCH, DEFAULT_MAX_FETCH,
};
pub use default::DefaultStream;
pub use error::StreamError;
pub use stream::{RangeStream, StreamCursor, StreamPosition};

use cogstream_range::RangeReader;

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Open the stream variant selected by `config.kind` over `reader`.
pub fn open_stream(
    reader: Box<dyn RangeReader>,
    config: &StreamConfig,
) -> Result<Box<dyn RangeStream>> {
    Ok(match config.kind {
        StreamKind::Default => Box::new(DefaultStream::open(reader, config)?),
        StreamKind::Caching => Box::new(CachingStream::open(reader, config)?),
    })
}
