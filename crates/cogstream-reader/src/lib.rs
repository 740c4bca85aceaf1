//! Region reads over cloud-optimized GeoTIFFs.
//!
//! [`CogReader`] ties the layers together: it binds a stream over a
//! [`RangeReader`](cogstream_range::RangeReader), parses the TIFF structure
//! on first use, plans each region read into coalesced fetches, decodes the
//! fetched tiles with the [`TileCodec`] registered for their compression and
//! composites the result into a [`RasterBuffer`].
//!
//! ```no_run
//! use cogstream_reader::{CogReader, ReaderConfig};
//!
//! let reader = CogReader::open("s3://bucket/scene.tif", ReaderConfig::default())?;
//! let overview = reader.num_levels()? - 1;
//! let info = reader.open_level(overview)?;
//! let raster = reader.read_region(overview, 0, 0, info.width, info.height, 1, 1)?;
//! println!("{}x{}", raster.width(), raster.height());
//! # Ok::<(), cogstream_reader::ReaderError>(())
//! ```

mod codec;
mod config;
mod error;
mod raster;
mod reader;

pub use codec::{CodecError, CodecRegistry, DecodeContext, TileCodec, Uncompressed};
pub use config::{ReaderConfig, TileErrorPolicy};
pub use error::ReaderError;
pub use raster::RasterBuffer;
pub use reader::{CogReader, LevelInfo, ReaderState};

/// Result type for reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;
