//! Tile selection and read coalescing for region requests.
//!
//! A region of a level, read every `sx`-th column and `sy`-th row, maps to
//! an output raster of `ceil(width / sx)` by `ceil(height / sy)` pixels.
//! The planner keeps only tiles holding at least one sampled pixel, works
//! out where each lands in the output, and merges their byte ranges into
//! as few fetches as the gap and size limits allow.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{LevelDescriptor, ParseError, Result, TileEntry};

/// Default largest gap of unrequested bytes bridged by one fetch (16 KiB).
pub const DEFAULT_COALESCE_GAP: u64 = 16 * 1024;

/// Default cap on one coalesced fetch (8 MiB).
pub const DEFAULT_MAX_COALESCED_LEN: u64 = 8 * 1024 * 1024;

/// Read coalescing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Tiles separated by at most this many bytes share a fetch.
    pub coalesce_gap: u64,
    /// A fetch is not grown past this length. A single larger tile still
    /// gets a fetch of its own.
    pub max_coalesced_len: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            coalesce_gap: DEFAULT_COALESCE_GAP,
            max_coalesced_len: DEFAULT_MAX_COALESCED_LEN,
        }
    }
}

impl PlannerConfig {
    /// Never merge tiles.
    pub fn no_coalescing() -> Self {
        Self {
            coalesce_gap: 0,
            max_coalesced_len: 0,
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
}

/// A pixel rectangle of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Left column.
    pub x: u32,
    /// Top row.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Region {
    /// Create a region.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// One tile of a plan and where its sampled pixels go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTile {
    /// The tile and its byte range.
    pub tile: TileEntry,
    /// Column of the first sampled pixel inside the tile.
    pub src_x: u32,
    /// Row of the first sampled pixel inside the tile.
    pub src_y: u32,
    /// Output column receiving that pixel.
    pub dest_x: u32,
    /// Output row receiving that pixel.
    pub dest_y: u32,
    /// Sampled columns taken from this tile.
    pub columns: u32,
    /// Sampled rows taken from this tile.
    pub rows: u32,
    /// Pixel index of `(dest_x, dest_y)` in the row-major output.
    pub dest_offset: usize,
}

/// One backend read covering the byte ranges of several tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedFetch {
    /// Start of the read.
    pub offset: u64,
    /// Length of the read.
    pub length: u64,
    /// Indices into [`TilePlan::tiles`] served by this read, in file order.
    pub tiles: Vec<usize>,
}

impl CoalescedFetch {
    /// Range of `tile`'s bytes within this fetch's buffer.
    pub fn slice_of(&self, tile: &TileEntry) -> Range<usize> {
        let start = (tile.byte_offset - self.offset) as usize;
        start..start + tile.byte_count as usize
    }

    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// The tiles and reads needed for one region request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    /// Level being read.
    pub level: u32,
    /// Requested region in level pixels.
    pub region: Region,
    /// Column subsampling factor.
    pub subsample_x: u32,
    /// Row subsampling factor.
    pub subsample_y: u32,
    /// Output raster width.
    pub out_width: u32,
    /// Output raster height.
    pub out_height: u32,
    /// Tiles in row-major grid order, sparse tiles included.
    pub tiles: Vec<PlannedTile>,
    /// Reads covering every non-sparse tile, in file order.
    pub fetches: Vec<CoalescedFetch>,
}

impl TilePlan {
    /// Bytes that will be requested from the backend.
    pub fn fetched_bytes(&self) -> u64 {
        self.fetches.iter().map(|f| f.length).sum()
    }

    /// Bytes belonging to tiles, without coalescing gaps.
    pub fn tile_bytes(&self) -> u64 {
        self.tiles.iter().map(|t| t.tile.byte_count as u64).sum()
    }
}

/// The sampled pixels one tile contributes along one axis.
#[derive(Debug, Clone, Copy)]
struct AxisSpan {
    index: u32,
    src: u32,
    dest: u32,
    count: u32,
}

/// Tiles along one axis holding at least one sample of
/// `start, start + step, ...` below `start + len`.
fn axis_spans(start: u32, len: u32, step: u32, tile: u32) -> Vec<AxisSpan> {
    let start = start as u64;
    let end = start + len as u64;
    let (step, tile) = (step as u64, tile as u64);

    let mut spans = Vec::new();
    for index in start / tile..=(end - 1) / tile {
        let tile_start = index * tile;
        let tile_end = (tile_start + tile).min(end);
        let from = tile_start.max(start);
        let first = (from - start).div_ceil(step);
        let sample = start + first * step;
        if sample >= tile_end {
            continue;
        }
        let last = (tile_end - 1 - start) / step;
        spans.push(AxisSpan {
            index: index as u32,
            src: (sample - tile_start) as u32,
            dest: first as u32,
            count: (last - first + 1) as u32,
        });
    }
    spans
}

/// Plans tile reads for region requests.
#[derive(Debug, Clone, Default)]
pub struct TilePlanner {
    config: PlannerConfig,
}

impl TilePlanner {
    /// Create a planner.
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// The coalescing settings.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan the read of `region` of `level`, sampling every `subsample_x`-th
    /// column and `subsample_y`-th row.
    pub fn plan(
        &self,
        level: &LevelDescriptor,
        region: Region,
        subsample_x: u32,
        subsample_y: u32,
    ) -> Result<TilePlan> {
        if subsample_x == 0 || subsample_y == 0 {
            return Err(ParseError::InvalidRegion(format!(
                "subsampling {subsample_x}x{subsample_y} must be positive"
            )));
        }
        if region.width == 0 || region.height == 0 {
            return Err(ParseError::InvalidRegion(format!(
                "empty region {}x{}",
                region.width, region.height
            )));
        }
        let right = region.x as u64 + region.width as u64;
        let bottom = region.y as u64 + region.height as u64;
        if right > level.width as u64 || bottom > level.height as u64 {
            return Err(ParseError::InvalidRegion(format!(
                "region {}x{}+{}+{} exceeds level {} of {}x{}",
                region.width, region.height, region.x, region.y, level.index, level.width, level.height
            )));
        }

        let out_width = region.width.div_ceil(subsample_x);
        let out_height = region.height.div_ceil(subsample_y);
        let columns = axis_spans(region.x, region.width, subsample_x, level.tile_width);
        let rows = axis_spans(region.y, region.height, subsample_y, level.tile_height);

        let mut tiles = Vec::with_capacity(columns.len() * rows.len());
        for row in &rows {
            for col in &columns {
                let tile = level.tile(row.index, col.index).ok_or_else(|| {
                    ParseError::malformed(format!(
                        "level {} has no tile at row {} column {}",
                        level.index, row.index, col.index
                    ))
                })?;
                tiles.push(PlannedTile {
                    tile: *tile,
                    src_x: col.src,
                    src_y: row.src,
                    dest_x: col.dest,
                    dest_y: row.dest,
                    columns: col.count,
                    rows: row.count,
                    dest_offset: row.dest as usize * out_width as usize + col.dest as usize,
                });
            }
        }

        let fetches = self.coalesce(&tiles);
        Ok(TilePlan {
            level: level.index,
            region,
            subsample_x,
            subsample_y,
            out_width,
            out_height,
            tiles,
            fetches,
        })
    }

    /// Merge the byte ranges of non-sparse tiles into fetches.
    fn coalesce(&self, tiles: &[PlannedTile]) -> Vec<CoalescedFetch> {
        let mut order: Vec<usize> = (0..tiles.len())
            .filter(|&i| !tiles[i].tile.is_sparse())
            .collect();
        order.sort_by_key(|&i| (tiles[i].tile.byte_offset, i));

        let mut fetches: Vec<CoalescedFetch> = Vec::new();
        for i in order {
            let tile = &tiles[i].tile;
            if let Some(current) = fetches.last_mut() {
                let end = current.end().max(tile.byte_end());
                let near = tile.byte_offset <= current.end().saturating_add(self.config.coalesce_gap);
                if near && end - current.offset <= self.config.max_coalesced_len.max(current.length) {
                    current.length = end - current.offset;
                    current.tiles.push(i);
                    continue;
                }
            }
            fetches.push(CoalescedFetch {
                offset: tile.byte_offset,
                length: tile.byte_count as u64,
                tiles: vec![i],
            });
        }
        fetches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Organisation, PixelLayout};
    use tiff::tags::{CompressionMethod, SampleFormat};

    /// A level whose tiles are stored back to back, `tile_bytes` each, in
    /// row-major order starting at offset 1000.
    fn level(width: u32, height: u32, tile: u32, tile_bytes: u32) -> LevelDescriptor {
        let tiles_across = width.div_ceil(tile);
        let tiles_down = height.div_ceil(tile);
        let tiles = (0..tiles_across * tiles_down)
            .map(|i| TileEntry {
                level: 0,
                row: i / tiles_across,
                col: i % tiles_across,
                byte_offset: 1000 + i as u64 * tile_bytes as u64,
                byte_count: tile_bytes,
                compression: CompressionMethod::None,
            })
            .collect();
        LevelDescriptor {
            index: 0,
            width,
            height,
            tile_width: tile,
            tile_height: tile,
            tiles_across,
            tiles_down,
            organisation: Organisation::Tiled,
            layout: PixelLayout {
                samples_per_pixel: 1,
                bits_per_sample: 8,
                sample_format: SampleFormat::Uint,
                predictor: 1,
                photometric: Some(1),
                jpeg_tables: None,
            },
            tiles,
            ifd_offset: 8,
        }
    }

    #[test]
    fn test_selects_intersecting_tiles() {
        let level = level(1024, 512, 256, 100);
        let plan = TilePlanner::default()
            .plan(&level, Region::new(200, 100, 100, 200), 1, 1)
            .unwrap();

        let grid: Vec<(u32, u32)> = plan.tiles.iter().map(|t| (t.tile.row, t.tile.col)).collect();
        assert_eq!(grid, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!((plan.out_width, plan.out_height), (100, 200));

        let second = &plan.tiles[1];
        assert_eq!((second.src_x, second.src_y), (0, 100));
        assert_eq!((second.dest_x, second.dest_y), (56, 0));
        assert_eq!((second.columns, second.rows), (44, 156));
        assert_eq!(second.dest_offset, 56);

        let last = &plan.tiles[3];
        assert_eq!((last.dest_x, last.dest_y), (56, 156));
        assert_eq!(last.dest_offset, 156 * 100 + 56);
    }

    #[test]
    fn test_subsampling_skips_tiles_without_samples() {
        // Columns 0, 300, 600, 900 are sampled: tile column 2 (512..768)
        // holds 600, tile column 1 (256..512) holds 300, tile column 3 holds 900.
        let level = level(1024, 256, 256, 100);
        let plan = TilePlanner::default()
            .plan(&level, Region::new(0, 0, 1000, 1), 300, 1)
            .unwrap();
        assert_eq!(plan.out_width, 4);
        let cols: Vec<u32> = plan.tiles.iter().map(|t| t.tile.col).collect();
        assert_eq!(cols, vec![0, 1, 2, 3]);

        // With step 600 only columns 0 and 600 are sampled.
        let plan = TilePlanner::default()
            .plan(&level, Region::new(0, 0, 1000, 1), 600, 1)
            .unwrap();
        let cols: Vec<u32> = plan.tiles.iter().map(|t| t.tile.col).collect();
        assert_eq!(cols, vec![0, 2]);
        assert_eq!(plan.tiles[1].src_x, 600 - 512);
        assert_eq!(plan.tiles[1].dest_x, 1);
    }

    #[test]
    fn test_sampled_counts_cover_output() {
        let level = level(1000, 700, 128, 10);
        for (sx, sy) in [(1, 1), (2, 3), (7, 5), (128, 1), (129, 200)] {
            let region = Region::new(13, 27, 901, 650);
            let plan = TilePlanner::default().plan(&level, region, sx, sy).unwrap();
            let first_row: u32 = plan
                .tiles
                .iter()
                .filter(|t| t.dest_y == 0)
                .map(|t| t.columns)
                .sum();
            let first_col: u32 = plan
                .tiles
                .iter()
                .filter(|t| t.dest_x == 0)
                .map(|t| t.rows)
                .sum();
            assert_eq!(first_row, plan.out_width, "sx={sx}");
            assert_eq!(first_col, plan.out_height, "sy={sy}");
        }
    }

    #[test]
    fn test_adjacent_tiles_coalesce() {
        let level = level(1024, 256, 256, 100);
        let plan = TilePlanner::default()
            .plan(&level, Region::new(0, 0, 1024, 256), 1, 1)
            .unwrap();
        assert_eq!(plan.fetches.len(), 1);
        assert_eq!(plan.fetches[0].offset, 1000);
        assert_eq!(plan.fetches[0].length, 400);
        assert_eq!(plan.fetches[0].slice_of(&plan.tiles[2].tile), 200..300);
    }

    #[test]
    fn test_gap_threshold_splits_fetches() {
        let mut level = level(768, 256, 256, 100);
        level.tiles[2].byte_offset = 5000;
        let config = PlannerConfig {
            coalesce_gap: 1000,
            ..PlannerConfig::default()
        };
        let plan = TilePlanner::new(config)
            .plan(&level, Region::new(0, 0, 768, 256), 1, 1)
            .unwrap();
        let ranges: Vec<(u64, u64)> = plan.fetches.iter().map(|f| (f.offset, f.length)).collect();
        assert_eq!(ranges, vec![(1000, 200), (5000, 100)]);

        // A gap within the threshold is bridged.
        level.tiles[2].byte_offset = 1900;
        let plan = TilePlanner::new(PlannerConfig {
            coalesce_gap: 1000,
            ..PlannerConfig::default()
        })
        .plan(&level, Region::new(0, 0, 768, 256), 1, 1)
        .unwrap();
        assert_eq!(plan.fetches.len(), 1);
        assert_eq!(plan.fetches[0].length, 1000);
    }

    #[test]
    fn test_max_len_caps_fetch() {
        let level = level(1024, 256, 256, 100);
        let config = PlannerConfig {
            coalesce_gap: 0,
            max_coalesced_len: 250,
        };
        let plan = TilePlanner::new(config)
            .plan(&level, Region::new(0, 0, 1024, 256), 1, 1)
            .unwrap();
        let ranges: Vec<(u64, u64)> = plan.fetches.iter().map(|f| (f.offset, f.length)).collect();
        assert_eq!(ranges, vec![(1000, 200), (1200, 200)]);
    }

    #[test]
    fn test_out_of_order_tiles_fetch_in_file_order() {
        let mut level = level(512, 256, 256, 100);
        level.tiles[0].byte_offset = 1100;
        level.tiles[1].byte_offset = 1000;
        let plan = TilePlanner::new(PlannerConfig::no_coalescing())
            .plan(&level, Region::new(0, 0, 512, 256), 1, 1)
            .unwrap();
        assert_eq!(plan.fetches[0].tiles, vec![1]);
        assert_eq!(plan.fetches[1].tiles, vec![0]);
    }

    #[test]
    fn test_sparse_tiles_are_not_fetched() {
        let mut level = level(512, 256, 256, 100);
        level.tiles[1].byte_offset = 0;
        level.tiles[1].byte_count = 0;
        let plan = TilePlanner::default()
            .plan(&level, Region::new(0, 0, 512, 256), 1, 1)
            .unwrap();
        assert_eq!(plan.tiles.len(), 2);
        assert_eq!(plan.fetches.len(), 1);
        assert_eq!(plan.fetches[0].tiles, vec![0]);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let level = level(100, 100, 64, 10);
        let planner = TilePlanner::default();
        assert!(matches!(
            planner.plan(&level, Region::new(50, 0, 51, 10), 1, 1),
            Err(ParseError::InvalidRegion(_))
        ));
        assert!(matches!(
            planner.plan(&level, Region::new(0, 0, 0, 10), 1, 1),
            Err(ParseError::InvalidRegion(_))
        ));
        assert!(matches!(
            planner.plan(&level, Region::new(0, 0, 10, 10), 0, 1),
            Err(ParseError::InvalidRegion(_))
        ));
        assert!(matches!(
            planner.plan(&level, Region::new(u32::MAX, 0, 10, 10), 1, 1),
            Err(ParseError::InvalidRegion(_))
        ));
    }
}
