//! The reader facade: lazy structure parsing, planned tile reads and
//! compositing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cogstream_metrics::{metric_defs, MetricLabels};
use cogstream_range::{
    BackendRegistry, ClientRegistry, ConnectionDescriptor, RangeReader, ReaderStatsSnapshot,
};
use cogstream_stream::{
    open_stream, CacheStatsSnapshot, RangeStream, StreamCursor, StreamError,
};
use cogstream_tiff::{
    parse_structure, CoalescedFetch, CogStructure, CompressionMethod, LevelDescriptor,
    Organisation, PlannedTile, Region, TilePlan, TilePlanner,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    CodecError, CodecRegistry, DecodeContext, RasterBuffer, ReaderConfig, ReaderError, Result,
    TileCodec, TileErrorPolicy,
};

/// Externally observable lifecycle of a [`CogReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    /// A stream is bound; the structure has not been read.
    Open,
    /// The structure is parsed and cached.
    StructureParsed,
    /// At least one region read has been served.
    Serving,
    /// The reader was closed.
    Closed,
}

/// Dimensions and layout of one resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelInfo {
    /// Level index, 0 being full resolution.
    pub index: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Tile width in pixels.
    pub tile_width: u32,
    /// Tile height in pixels.
    pub tile_height: u32,
    /// Tile columns.
    pub tiles_across: u32,
    /// Tile rows.
    pub tiles_down: u32,
    /// Samples per pixel.
    pub samples_per_pixel: u16,
    /// Bits per sample.
    pub bits_per_sample: u16,
    /// Compression of the level's tiles.
    pub compression: CompressionMethod,
    /// Whether the level is stored as strips.
    pub stripped: bool,
}

impl LevelInfo {
    fn of(level: &LevelDescriptor) -> Self {
        Self {
            index: level.index,
            width: level.width,
            height: level.height,
            tile_width: level.tile_width,
            tile_height: level.tile_height,
            tiles_across: level.tiles_across,
            tiles_down: level.tiles_down,
            samples_per_pixel: level.layout.samples_per_pixel,
            bits_per_sample: level.layout.bits_per_sample,
            compression: level.compression().unwrap_or(CompressionMethod::None),
            stripped: level.organisation == Organisation::Stripped,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Open,
    Parsed(Arc<CogStructure>),
    Closed,
}

/// Reads regions of a COG through one stream.
///
/// The structure is parsed on the first query that needs it and kept for
/// the reader's lifetime. A failed parse leaves the reader open so a later
/// query can try again. Region reads take `&self` and may run concurrently.
#[derive(Debug)]
pub struct CogReader {
    stream: Box<dyn RangeStream>,
    config: ReaderConfig,
    planner: TilePlanner,
    codecs: CodecRegistry,
    phase: Mutex<Phase>,
    parsing: Mutex<()>,
    serving: AtomicBool,
    labels: MetricLabels,
}

impl CogReader {
    /// Bind a reader to an open stream.
    pub fn from_stream(stream: Box<dyn RangeStream>, config: ReaderConfig) -> Result<Self> {
        config.validate()?;
        let labels = MetricLabels::new(stream.backend().as_str(), stream.location());
        Ok(Self {
            stream,
            planner: TilePlanner::new(config.planner.clone()),
            config,
            codecs: CodecRegistry::new(),
            phase: Mutex::new(Phase::Open),
            parsing: Mutex::new(()),
            serving: AtomicBool::new(false),
            labels,
        })
    }

    /// Open the configured stream over `reader` and bind to it.
    pub fn from_reader(reader: Box<dyn RangeReader>, config: ReaderConfig) -> Result<Self> {
        config.validate()?;
        let stream = open_stream(reader, &config.stream)?;
        Self::from_stream(stream, config)
    }

    /// Open `location` (a path or a `file`, `http(s)`, `s3`, `gs` or `az`
    /// URL) with the built-in backends.
    pub fn open(location: &str, config: ReaderConfig) -> Result<Self> {
        let descriptor = ConnectionDescriptor::parse(location)?;
        Self::open_with(
            &descriptor,
            config,
            &BackendRegistry::builtin(),
            &ClientRegistry::new(),
        )
    }

    /// Open `descriptor` with the caller's backend selector and clients.
    pub fn open_with(
        descriptor: &ConnectionDescriptor,
        config: ReaderConfig,
        backends: &BackendRegistry,
        clients: &ClientRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let reader = backends.open(descriptor, &config.range, clients)?;
        debug!(backend = %descriptor.kind(), location = %descriptor.location(), "opened reader");
        Self::from_reader(reader, config)
    }

    /// Replace the codec registry.
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// The reader's configuration.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// The parsed structure, parsing it on first use.
    ///
    /// Concurrent callers wait for a single parse. The phase lock is not
    /// held while the parse reads the stream, so [`close`](Self::close)
    /// never waits on it.
    pub fn structure(&self) -> Result<Arc<CogStructure>> {
        if let Some(known) = self.parsed()? {
            return Ok(known);
        }
        let _parsing = self.parsing.lock();
        if let Some(known) = self.parsed()? {
            return Ok(known);
        }

        let parsed = parse_structure(self.stream.as_ref());
        let mut phase = self.phase.lock();
        if matches!(*phase, Phase::Closed) || self.stream.is_closed() {
            return Err(ReaderError::Closed);
        }
        let structure = Arc::new(parsed?);
        debug!(
            location = self.stream.location(),
            levels = structure.num_levels(),
            bigtiff = structure.bigtiff,
            "parsed structure"
        );
        *phase = Phase::Parsed(Arc::clone(&structure));
        Ok(structure)
    }

    fn parsed(&self) -> Result<Option<Arc<CogStructure>>> {
        match &*self.phase.lock() {
            Phase::Closed => Err(ReaderError::Closed),
            Phase::Parsed(structure) => Ok(Some(Arc::clone(structure))),
            Phase::Open => Ok(None),
        }
    }

    /// Number of resolution levels.
    pub fn num_levels(&self) -> Result<u32> {
        Ok(self.structure()?.num_levels() as u32)
    }

    /// Dimensions of level `index`.
    pub fn open_level(&self, index: u32) -> Result<LevelInfo> {
        let structure = self.structure()?;
        Ok(LevelInfo::of(structure.level(index as usize)?))
    }

    /// Read the `width` x `height` region at `(x, y)` of `level`, keeping
    /// every `subsample_x`-th column and `subsample_y`-th row.
    #[allow(clippy::too_many_arguments)]
    pub fn read_region(
        &self,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        subsample_x: u32,
        subsample_y: u32,
    ) -> Result<RasterBuffer> {
        self.read(level, Region::new(x, y, width, height), subsample_x, subsample_y)
    }

    /// Read `region` of `level` with the given subsampling.
    pub fn read(
        &self,
        level: u32,
        region: Region,
        subsample_x: u32,
        subsample_y: u32,
    ) -> Result<RasterBuffer> {
        let structure = self.structure()?;
        let level = structure.level(level as usize)?;
        let codec = self.codec_for(level)?;
        let plan = self.planner.plan(level, region, subsample_x, subsample_y)?;
        debug!(
            level = level.index,
            tiles = plan.tiles.len(),
            fetches = plan.fetches.len(),
            bytes = plan.fetched_bytes(),
            "planned region read"
        );
        self.serving.store(true, Ordering::Release);

        let raw = self.fetch_tiles(&plan)?;
        let decoded = self.decode_tiles(level, &plan, &raw, codec.as_ref());

        let mut raster = RasterBuffer::filled(
            plan.out_width,
            plan.out_height,
            level.layout.bytes_per_pixel(),
            self.config.fill_byte,
        );
        let mut composited = 0u64;
        for (planned, result) in plan.tiles.iter().zip(decoded) {
            let Some(result) = result else {
                continue;
            };
            let (decoded_width, _) = level.decoded_tile_size(&planned.tile);
            let outcome = result.and_then(|pixels| {
                raster.composite(planned, &pixels, decoded_width, subsample_x, subsample_y)
            });
            match outcome {
                Ok(()) => composited += 1,
                Err(source) => self.tile_failed(planned, source, &mut raster)?,
            }
        }
        metrics::counter!(metric_defs::TILES_DECODED.name, &self.labels.to_labels())
            .increment(composited);
        Ok(raster)
    }

    /// Close the reader and its stream. Later calls fail with
    /// [`ReaderError::Closed`].
    pub fn close(&self) {
        self.stream.close();
        *self.phase.lock() = Phase::Closed;
    }

    /// The reader's lifecycle state.
    pub fn state(&self) -> ReaderState {
        match &*self.phase.lock() {
            Phase::Open => ReaderState::Open,
            Phase::Parsed(_) if self.serving.load(Ordering::Acquire) => ReaderState::Serving,
            Phase::Parsed(_) => ReaderState::StructureParsed,
            Phase::Closed => ReaderState::Closed,
        }
    }

    /// Backend request counters.
    pub fn reader_stats(&self) -> ReaderStatsSnapshot {
        self.stream.reader_stats()
    }

    /// Block cache counters, for caching streams.
    pub fn cache_stats(&self) -> Option<CacheStatsSnapshot> {
        self.stream.cache_stats()
    }

    fn codec_for(&self, level: &LevelDescriptor) -> Result<Arc<dyn TileCodec>> {
        let layout = &level.layout;
        if layout.bits_per_sample == 0 || layout.bits_per_sample % 8 != 0 {
            return Err(ReaderError::Unsupported(format!(
                "{} bits per sample",
                layout.bits_per_sample
            )));
        }
        let compression = level.compression().unwrap_or(CompressionMethod::None);
        self.codecs
            .get(compression)
            .cloned()
            .ok_or_else(|| ReaderError::UnsupportedCompression {
                code: compression.to_u16(),
                name: format!("{compression:?}"),
            })
    }

    /// Run `f` over `items`, on the rayon pool when parallel reads are on.
    fn run<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        if self.config.parallel && items.len() > 1 {
            items.par_iter().map(f).collect()
        } else {
            items.iter().map(f).collect()
        }
    }

    fn fetch(&self, fetch: &CoalescedFetch) -> std::result::Result<Bytes, StreamError> {
        let mut cursor = StreamCursor::new(self.stream.as_ref());
        cursor.seek_to(fetch.offset)?;
        cursor.read_bytes(fetch.length as usize)
    }

    /// Raw bytes of every planned tile, `None` for sparse tiles.
    fn fetch_tiles(&self, plan: &TilePlan) -> Result<Vec<Option<Bytes>>> {
        let buffers = self.run(&plan.fetches, |fetch| self.fetch(fetch));

        let mut raw = vec![None; plan.tiles.len()];
        for (fetch, buffer) in plan.fetches.iter().zip(buffers) {
            let buffer = buffer?;
            for &index in &fetch.tiles {
                let range = fetch.slice_of(&plan.tiles[index].tile);
                raw[index] = Some(buffer.slice(range));
            }
        }
        Ok(raw)
    }

    fn decode_tiles(
        &self,
        level: &LevelDescriptor,
        plan: &TilePlan,
        raw: &[Option<Bytes>],
        codec: &dyn TileCodec,
    ) -> Vec<Option<std::result::Result<Bytes, CodecError>>> {
        let jobs: Vec<(&PlannedTile, Option<&Bytes>)> =
            plan.tiles.iter().zip(raw.iter().map(Option::as_ref)).collect();
        self.run(&jobs, |(planned, data)| {
            let data = (*data)?.clone();
            let (width, height) = level.decoded_tile_size(&planned.tile);
            let ctx = DecodeContext {
                tile: &planned.tile,
                width,
                height,
                layout: &level.layout,
            };
            Some(codec.decode(data, &ctx).and_then(|pixels| {
                if pixels.len() == ctx.expected_len() {
                    Ok(pixels)
                } else {
                    Err(CodecError::SizeMismatch {
                        expected: ctx.expected_len(),
                        actual: pixels.len(),
                    })
                }
            }))
        })
    }

    fn tile_failed(
        &self,
        planned: &PlannedTile,
        source: CodecError,
        raster: &mut RasterBuffer,
    ) -> Result<()> {
        let policy = self.config.tile_error_policy;
        let tile = &planned.tile;
        metrics::counter!(
            metric_defs::TILE_FAILURES.name,
            &self.labels.with(&[("policy", policy.as_str().to_string())])
        )
        .increment(1);
        match policy {
            TileErrorPolicy::Abort => Err(ReaderError::Tile {
                level: tile.level,
                row: tile.row,
                col: tile.col,
                source,
            }),
            TileErrorPolicy::Skip => {
                warn!(
                    level = tile.level,
                    row = tile.row,
                    col = tile.col,
                    error = %source,
                    "skipping tile"
                );
                raster.skip(tile.row, tile.col);
                Ok(())
            }
        }
    }
}
