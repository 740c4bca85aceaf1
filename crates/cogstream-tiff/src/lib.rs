//! Structural parsing and tile planning for cloud-optimized GeoTIFFs.
//!
//! [`parse_structure`] reads the header and directory chain of a TIFF or
//! BigTIFF file through a [`RangeStream`](cogstream_stream::RangeStream)
//! and produces a [`CogStructure`]: one [`LevelDescriptor`] per resolution
//! level, each listing the byte range of every tile. Pixel data is never
//! touched.
//!
//! [`TilePlanner`] turns a region request against one level into the tiles
//! to decode, where each lands in the output, and a short list of
//! coalesced byte-range fetches.
//!
//! # Example
//!
//! ```no_run
//! use cogstream_range::LocalFileReader;
//! use cogstream_stream::{open_stream, StreamConfig};
//! use cogstream_tiff::{parse_structure, Region, TilePlanner};
//!
//! let reader = LocalFileReader::open("scene.tif")?;
//! let stream = open_stream(Box::new(reader), &StreamConfig::default())?;
//! let structure = parse_structure(stream.as_ref())?;
//!
//! let level = structure.level(0)?;
//! let plan = TilePlanner::default().plan(level, Region::new(0, 0, 512, 512), 1, 1)?;
//! println!("{} tiles in {} fetches", plan.tiles.len(), plan.fetches.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod ifd;
mod planner;
mod structure;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::ParseError;
pub use ifd::{ByteOrder, TiffHeader};
pub use planner::{
    CoalescedFetch, PlannedTile, PlannerConfig, Region, TilePlan, TilePlanner,
    DEFAULT_COALESCE_GAP, DEFAULT_MAX_COALESCED_LEN,
};
pub use structure::{
    parse_structure, CogStructure, LevelDescriptor, Organisation, PixelLayout, TileEntry,
};
pub use tiff::tags::{CompressionMethod, SampleFormat};

/// Result type for parsing and planning.
pub type Result<T> = std::result::Result<T, ParseError>;
