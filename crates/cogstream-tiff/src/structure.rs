//! Resolution levels and tile byte ranges of a COG.
//!
//! [`parse_structure`] walks the IFD chain through a stream, reading only
//! directory bytes, and returns a [`CogStructure`]: the full-resolution
//! image followed by its overviews, coarsest last, each with the byte range
//! of every tile.

use std::collections::HashSet;

use bytes::Bytes;
use cogstream_stream::{RangeStream, StreamCursor};
use tiff::tags::{CompressionMethod, SampleFormat, Tag};
use tracing::debug;

use crate::ifd::{ByteOrder, Ifd, IfdReader, TiffHeader};
use crate::{ParseError, Result};

/// Upper bound on directories in one file.
const MAX_IFDS: usize = 1024;

/// `NewSubfileType` bit marking a reduced-resolution image.
const SUBFILE_REDUCED: u64 = 0x1;

/// `NewSubfileType` bit marking a transparency mask.
const SUBFILE_MASK: u64 = 0x4;

/// One tile of one level, located in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEntry {
    /// Level index, 0 being full resolution.
    pub level: u32,
    /// Tile row.
    pub row: u32,
    /// Tile column.
    pub col: u32,
    /// Offset of the compressed tile bytes.
    pub byte_offset: u64,
    /// Length of the compressed tile bytes. Zero for a sparse tile.
    pub byte_count: u32,
    /// Compression of the tile bytes, passed through to the codec.
    pub compression: CompressionMethod,
}

impl TileEntry {
    /// A tile with no stored bytes.
    pub fn is_sparse(&self) -> bool {
        self.byte_count == 0
    }

    /// End of the tile's byte range (exclusive).
    pub fn byte_end(&self) -> u64 {
        self.byte_offset + self.byte_count as u64
    }
}

/// How a level's pixels are chunked in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Organisation {
    /// `TileWidth` by `TileLength` tiles, edge tiles padded.
    Tiled,
    /// Full-width strips of `RowsPerStrip` rows, the last one shorter.
    Stripped,
}

/// Sample layout of a level, as far as the codec and compositor need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelLayout {
    /// Samples per pixel.
    pub samples_per_pixel: u16,
    /// Bits per sample (identical for every sample).
    pub bits_per_sample: u16,
    /// Interpretation of each sample.
    pub sample_format: SampleFormat,
    /// `Predictor` tag, 1 when absent.
    pub predictor: u16,
    /// `PhotometricInterpretation` tag, if present.
    pub photometric: Option<u16>,
    /// `JPEGTables` shared by every tile of the level.
    pub jpeg_tables: Option<Bytes>,
}

impl PixelLayout {
    /// Bytes of one interleaved pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        self.samples_per_pixel as usize * (self.bits_per_sample as usize).div_ceil(8)
    }
}

/// One resolution level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelDescriptor {
    /// Level index, 0 being full resolution.
    pub index: u32,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Tile width in pixels.
    pub tile_width: u32,
    /// Tile height in pixels.
    pub tile_height: u32,
    /// Tiles per row of the grid.
    pub tiles_across: u32,
    /// Tile rows in the grid.
    pub tiles_down: u32,
    /// Tiles or strips.
    pub organisation: Organisation,
    /// Sample layout.
    pub layout: PixelLayout,
    /// Every tile in row-major order.
    pub tiles: Vec<TileEntry>,
    /// Offset of the directory describing this level.
    pub ifd_offset: u64,
}

impl LevelDescriptor {
    /// The tile at grid position `(row, col)`.
    pub fn tile(&self, row: u32, col: u32) -> Option<&TileEntry> {
        if row >= self.tiles_down || col >= self.tiles_across {
            return None;
        }
        self.tiles.get((row * self.tiles_across + col) as usize)
    }

    /// Pixel size of the decoded tile: tiles are padded to full size, the
    /// last strip only holds the remaining rows.
    pub fn decoded_tile_size(&self, tile: &TileEntry) -> (u32, u32) {
        match self.organisation {
            Organisation::Tiled => (self.tile_width, self.tile_height),
            Organisation::Stripped => {
                let top = tile.row * self.tile_height;
                (self.tile_width, self.tile_height.min(self.height - top))
            }
        }
    }

    /// Compression shared by the level's tiles.
    pub fn compression(&self) -> Option<CompressionMethod> {
        self.tiles.first().map(|tile| tile.compression)
    }
}

/// The parsed index of a COG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CogStructure {
    /// Byte order of the file.
    pub byte_order: ByteOrder,
    /// Whether the file is BigTIFF.
    pub bigtiff: bool,
    /// Object length in bytes.
    pub length: u64,
    /// Levels from full resolution to coarsest.
    pub levels: Vec<LevelDescriptor>,
}

impl CogStructure {
    /// Number of resolution levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Level `index`, or [`ParseError::LevelOutOfRange`].
    pub fn level(&self, index: usize) -> Result<&LevelDescriptor> {
        self.levels.get(index).ok_or(ParseError::LevelOutOfRange {
            level: index,
            available: self.levels.len(),
        })
    }

    /// The full-resolution level.
    pub fn full_resolution(&self) -> Option<&LevelDescriptor> {
        self.levels.first()
    }
}

/// Scalar tags of one directory, read before any offset array.
#[derive(Debug)]
struct Directory {
    position: usize,
    ifd: Ifd,
    subfile: u64,
    width: u32,
    height: u32,
}

impl Directory {
    fn is_mask(&self) -> bool {
        self.subfile & SUBFILE_MASK != 0
    }

    fn is_reduced(&self) -> bool {
        self.subfile & SUBFILE_REDUCED != 0
    }
}

/// Parse the directory structure of the TIFF behind `stream`.
///
/// Only the header, the IFDs and their out-of-line values are read. Mask
/// directories and extra full-size pages are skipped without reading their
/// tile arrays.
pub fn parse_structure(stream: &dyn RangeStream) -> Result<CogStructure> {
    let length = stream.length();
    let head_len = (TiffHeader::MAX_LEN as u64).min(length) as usize;
    let head = stream.read_bytes(0, head_len)?;
    let header = TiffHeader::parse(&head)?;
    let mut reader = IfdReader::new(StreamCursor::new(stream), header);

    let directories = walk_chain(&mut reader)?;
    let primary = directories
        .iter()
        .find(|dir| !dir.is_mask())
        .ok_or(ParseError::NoLevels)?;
    let (full_width, full_height) = (primary.width, primary.height);
    let primary_position = primary.position;

    let mut selected: Vec<&Directory> = directories
        .iter()
        .filter(|dir| {
            if dir.is_mask() {
                debug!(ifd = dir.position, "skipping mask IFD");
                return false;
            }
            let keep = dir.position == primary_position
                || dir.is_reduced()
                || (dir.width < full_width && dir.height <= full_height)
                || (dir.height < full_height && dir.width <= full_width);
            if !keep {
                debug!(
                    ifd = dir.position,
                    width = dir.width,
                    height = dir.height,
                    "skipping extra page"
                );
            }
            keep
        })
        .collect();
    selected.sort_by(|a, b| {
        (a.position != primary_position)
            .cmp(&(b.position != primary_position))
            .then(b.width.cmp(&a.width))
            .then(b.height.cmp(&a.height))
    });

    let mut levels = Vec::with_capacity(selected.len());
    for (index, dir) in selected.into_iter().enumerate() {
        levels.push(read_level(&mut reader, dir, index as u32)?);
    }

    debug!(
        location = stream.location(),
        bigtiff = header.bigtiff,
        levels = levels.len(),
        width = full_width,
        height = full_height,
        "parsed TIFF structure"
    );
    Ok(CogStructure {
        byte_order: header.byte_order,
        bigtiff: header.bigtiff,
        length,
        levels,
    })
}

/// Follow the IFD chain, decoding the scalar tags of each directory.
fn walk_chain(reader: &mut IfdReader<'_>) -> Result<Vec<Directory>> {
    let mut visited = HashSet::new();
    let mut directories = Vec::new();
    let mut offset = reader.header().first_ifd;

    while offset != 0 {
        if !visited.insert(offset) {
            return Err(ParseError::IfdLoop(offset));
        }
        if directories.len() == MAX_IFDS {
            return Err(ParseError::malformed(format!("more than {MAX_IFDS} IFDs")));
        }

        let ifd = reader.read_ifd(offset)?;
        let position = directories.len();
        let subfile = match ifd.entry(Tag::NewSubfileType) {
            Some(entry) => reader.uint(entry)?,
            None => 0,
        };
        let width = required_u32(reader, &ifd, position, Tag::ImageWidth, "ImageWidth")?;
        let height = required_u32(reader, &ifd, position, Tag::ImageLength, "ImageLength")?;
        if width == 0 || height == 0 {
            return Err(ParseError::malformed(format!(
                "IFD {position} has empty dimensions {width}x{height}"
            )));
        }

        offset = ifd.next;
        directories.push(Directory {
            position,
            ifd,
            subfile,
            width,
            height,
        });
    }
    Ok(directories)
}

fn required_u32(
    reader: &mut IfdReader<'_>,
    ifd: &Ifd,
    position: usize,
    tag: Tag,
    name: &'static str,
) -> Result<u32> {
    let entry = ifd
        .entry(tag)
        .ok_or(ParseError::MissingTag { ifd: position, tag: name })?;
    to_u32(reader.uint(entry)?, name)
}

fn optional_u16(reader: &mut IfdReader<'_>, ifd: &Ifd, tag: Tag) -> Result<Option<u16>> {
    match ifd.entry(tag) {
        Some(entry) => Ok(Some(to_u16(reader.uint(entry)?, tag)?)),
        None => Ok(None),
    }
}

fn to_u32(value: u64, name: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| ParseError::malformed(format!("{name} {value} exceeds 32 bits")))
}

fn to_u16(value: u64, tag: Tag) -> Result<u16> {
    u16::try_from(value).map_err(|_| ParseError::malformed(format!("{tag:?} {value} exceeds 16 bits")))
}

/// Decode the pixel layout and tile index of one selected directory.
fn read_level(reader: &mut IfdReader<'_>, dir: &Directory, index: u32) -> Result<LevelDescriptor> {
    let ifd = &dir.ifd;
    let position = dir.position;

    let planar = optional_u16(reader, ifd, Tag::PlanarConfiguration)?.unwrap_or(1);
    if planar != 1 {
        return Err(ParseError::unsupported(format!(
            "IFD {position} uses planar configuration {planar}"
        )));
    }

    let samples_per_pixel = optional_u16(reader, ifd, Tag::SamplesPerPixel)?.unwrap_or(1);
    let bits_per_sample = match ifd.entry(Tag::BitsPerSample) {
        Some(entry) => {
            let bits = reader.uints(entry)?;
            let first = bits.first().copied().unwrap_or(1);
            if bits.iter().any(|b| *b != first) {
                return Err(ParseError::unsupported(format!(
                    "IFD {position} mixes bits per sample {bits:?}"
                )));
            }
            to_u16(first, Tag::BitsPerSample)?
        }
        None => 1,
    };
    let sample_format = match ifd.entry(Tag::SampleFormat) {
        Some(entry) => {
            let formats = reader.uints(entry)?;
            let first = formats.first().copied().unwrap_or(1);
            SampleFormat::from_u16_exhaustive(to_u16(first, Tag::SampleFormat)?)
        }
        None => SampleFormat::Uint,
    };
    let compression = CompressionMethod::from_u16_exhaustive(
        optional_u16(reader, ifd, Tag::Compression)?.unwrap_or(1),
    );
    let jpeg_tables = match ifd.entry(Tag::JPEGTables) {
        Some(entry) => Some(reader.value_bytes(entry)?),
        None => None,
    };
    let layout = PixelLayout {
        samples_per_pixel,
        bits_per_sample,
        sample_format,
        predictor: optional_u16(reader, ifd, Tag::Predictor)?.unwrap_or(1),
        photometric: optional_u16(reader, ifd, Tag::PhotometricInterpretation)?,
        jpeg_tables,
    };

    let (organisation, tile_width, tile_height, offsets_tag, counts_tag) =
        if ifd.entry(Tag::TileOffsets).is_some() || ifd.entry(Tag::TileWidth).is_some() {
            let tile_width = required_u32(reader, ifd, position, Tag::TileWidth, "TileWidth")?;
            let tile_height = required_u32(reader, ifd, position, Tag::TileLength, "TileLength")?;
            (
                Organisation::Tiled,
                tile_width,
                tile_height,
                (Tag::TileOffsets, "TileOffsets"),
                (Tag::TileByteCounts, "TileByteCounts"),
            )
        } else {
            let rows = match ifd.entry(Tag::RowsPerStrip) {
                Some(entry) => to_u32(reader.uint(entry)?, "RowsPerStrip")?,
                None => dir.height,
            };
            (
                Organisation::Stripped,
                dir.width,
                rows.min(dir.height),
                (Tag::StripOffsets, "StripOffsets"),
                (Tag::StripByteCounts, "StripByteCounts"),
            )
        };
    if tile_width == 0 || tile_height == 0 {
        return Err(ParseError::malformed(format!(
            "IFD {position} has empty tiles {tile_width}x{tile_height}"
        )));
    }

    let tiles_across = dir.width.div_ceil(tile_width);
    let tiles_down = dir.height.div_ceil(tile_height);
    let expected = tiles_across as usize * tiles_down as usize;

    let offsets_entry = ifd.entry(offsets_tag.0).ok_or(ParseError::MissingTag {
        ifd: position,
        tag: offsets_tag.1,
    })?;
    let counts_entry = ifd.entry(counts_tag.0).ok_or(ParseError::MissingTag {
        ifd: position,
        tag: counts_tag.1,
    })?;
    let offsets = reader.uints(offsets_entry)?;
    let counts = reader.uints(counts_entry)?;
    if offsets.len() != expected || counts.len() != expected {
        return Err(ParseError::malformed(format!(
            "IFD {position} has {} offsets and {} byte counts for a {tiles_across}x{tiles_down} grid",
            offsets.len(),
            counts.len()
        )));
    }

    let object_len = reader.object_len();
    let mut tiles = Vec::with_capacity(expected);
    for (i, (&byte_offset, &count)) in offsets.iter().zip(&counts).enumerate() {
        let byte_count = to_u32(count, "tile byte count")?;
        if byte_count > 0 && byte_offset.checked_add(count).map_or(true, |end| end > object_len) {
            return Err(ParseError::malformed(format!(
                "IFD {position} tile {i} at {byte_offset}+{count} runs past the object end"
            )));
        }
        tiles.push(TileEntry {
            level: index,
            row: i as u32 / tiles_across,
            col: i as u32 % tiles_across,
            byte_offset,
            byte_count,
            compression,
        });
    }

    Ok(LevelDescriptor {
        index,
        width: dir.width,
        height: dir.height,
        tile_width,
        tile_height,
        tiles_across,
        tiles_down,
        organisation,
        layout,
        tiles,
        ifd_offset: ifd.offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_value, CogBuilder, CogFile, LevelSpec};
    use cogstream_range::RangeError;
    use cogstream_stream::{DefaultStream, StreamConfig, StreamError};

    fn stream(file: &CogFile) -> DefaultStream {
        DefaultStream::open(Box::new(file.reader()), &StreamConfig::uncached()).unwrap()
    }

    fn parse(file: &CogFile) -> Result<CogStructure> {
        parse_structure(&stream(file))
    }

    #[test]
    fn test_pyramid_levels() {
        let file = CogBuilder::pyramid(1024, 512, 512, 1).build();
        let structure = parse(&file).unwrap();

        assert_eq!(structure.num_levels(), 2);
        let full = structure.level(0).unwrap();
        assert_eq!((full.width, full.height), (1024, 512));
        assert_eq!((full.tiles_across, full.tiles_down), (2, 1));
        assert_eq!(full.organisation, Organisation::Tiled);

        let overview = structure.level(1).unwrap();
        assert_eq!((overview.width, overview.height), (512, 256));
        assert_eq!((overview.tile_width, overview.tile_height), (512, 512));
        assert_eq!(overview.tiles.len(), 1);
        assert_eq!(overview.tiles[0].level, 1);

        assert!(matches!(
            structure.level(2),
            Err(ParseError::LevelOutOfRange { level: 2, available: 2 })
        ));
    }

    #[test]
    fn test_tile_ranges_point_at_tile_data() {
        let file = CogBuilder::pyramid(300, 200, 128, 0).build();
        let structure = parse(&file).unwrap();
        let level = structure.level(0).unwrap();
        assert_eq!((level.tiles_across, level.tiles_down), (3, 2));

        let tile = level.tile(1, 2).unwrap();
        assert_eq!((tile.row, tile.col), (1, 2));
        assert_eq!(tile.byte_count, 128 * 128);
        let first = file.bytes[tile.byte_offset as usize];
        assert_eq!(first, sample_value(0, 256, 128, 0));
        assert!(level.tile(2, 0).is_none());
    }

    #[test]
    fn test_byte_orders_and_bigtiff() {
        for byte_order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
            for bigtiff in [false, true] {
                let file = CogBuilder::pyramid(600, 400, 256, 2)
                    .byte_order(byte_order)
                    .bigtiff(bigtiff)
                    .build();
                let structure = parse(&file).unwrap();
                assert_eq!(structure.byte_order, byte_order);
                assert_eq!(structure.bigtiff, bigtiff);

                let dims: Vec<(u32, u32)> =
                    structure.levels.iter().map(|l| (l.width, l.height)).collect();
                assert_eq!(dims, vec![(600, 400), (300, 200), (150, 100)]);

                let tile = structure.levels[1].tiles[1];
                assert_eq!(
                    file.bytes[tile.byte_offset as usize],
                    sample_value(1, 256, 0, 0),
                    "{byte_order:?} bigtiff={bigtiff}"
                );
            }
        }
    }

    #[test]
    fn test_levels_sorted_by_resolution() {
        let file = CogBuilder::new()
            .level(LevelSpec::tiled(800, 800, 256, 256))
            .level(LevelSpec::tiled(200, 200, 256, 256).overview())
            .level(LevelSpec::tiled(400, 400, 256, 256).overview())
            .build();
        let structure = parse(&file).unwrap();
        let widths: Vec<u32> = structure.levels.iter().map(|l| l.width).collect();
        assert_eq!(widths, vec![800, 400, 200]);
        let indices: Vec<u32> = structure.levels.iter().map(|l| l.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(structure.levels[1].tiles.iter().all(|t| t.level == 1));
    }

    #[test]
    fn test_masks_and_pages_are_skipped() {
        let file = CogBuilder::new()
            .level(LevelSpec::tiled(512, 512, 256, 256))
            .level(LevelSpec::tiled(512, 512, 256, 256).mask())
            .level(LevelSpec::tiled(512, 512, 256, 256).page())
            .level(LevelSpec::tiled(256, 256, 256, 256).overview())
            .build();
        let structure = parse(&file).unwrap();
        assert_eq!(structure.num_levels(), 2);
        assert_eq!(structure.levels[0].ifd_offset, file.ifd_offsets[0]);
        assert_eq!(structure.levels[1].ifd_offset, file.ifd_offsets[3]);
    }

    #[test]
    fn test_untagged_smaller_ifd_is_an_overview() {
        let file = CogBuilder::new()
            .level(LevelSpec::tiled(512, 512, 256, 256))
            .level(LevelSpec::tiled(256, 256, 256, 256))
            .build();
        assert_eq!(parse(&file).unwrap().num_levels(), 2);
    }

    #[test]
    fn test_strips_become_full_width_tiles() {
        let file = CogBuilder::new()
            .level(LevelSpec::stripped(100, 50, 16))
            .build();
        let structure = parse(&file).unwrap();
        let level = structure.level(0).unwrap();
        assert_eq!(level.organisation, Organisation::Stripped);
        assert_eq!((level.tile_width, level.tile_height), (100, 16));
        assert_eq!((level.tiles_across, level.tiles_down), (1, 4));
        assert_eq!(level.decoded_tile_size(&level.tiles[0]), (100, 16));
        assert_eq!(level.decoded_tile_size(&level.tiles[3]), (100, 2));
        assert_eq!(level.tiles[3].byte_count, 200);
    }

    #[test]
    fn test_pixel_layout() {
        let tables = vec![0xFF, 0xD8, 0xFF, 0xDB, 0, 4, 1, 2, 0xFF, 0xD9];
        let file = CogBuilder::new()
            .byte_order(ByteOrder::BigEndian)
            .level(
                LevelSpec::tiled(64, 64, 32, 32)
                    .samples(3, 16)
                    .compression(8)
                    .jpeg_tables(tables.clone()),
            )
            .build();
        let structure = parse(&file).unwrap();
        let level = structure.level(0).unwrap();
        assert_eq!(level.layout.samples_per_pixel, 3);
        assert_eq!(level.layout.bits_per_sample, 16);
        assert_eq!(level.layout.bytes_per_pixel(), 6);
        assert_eq!(level.layout.sample_format, SampleFormat::Uint);
        assert_eq!(level.layout.photometric, Some(2));
        assert_eq!(level.layout.jpeg_tables.as_deref(), Some(&tables[..]));
        assert_eq!(level.compression(), Some(CompressionMethod::Deflate));
        assert_eq!(level.tiles[0].byte_count, 32 * 32 * 6);
    }

    #[test]
    fn test_sparse_tiles_have_zero_count() {
        let file = CogBuilder::new()
            .level(LevelSpec::tiled(512, 256, 256, 256).sparse(0, 1))
            .build();
        let structure = parse(&file).unwrap();
        let level = structure.level(0).unwrap();
        assert!(!level.tiles[0].is_sparse());
        assert!(level.tiles[1].is_sparse());
    }

    #[test]
    fn test_planar_separate_is_rejected() {
        let file = CogBuilder::new()
            .level(LevelSpec::tiled(64, 64, 32, 32).planar(2))
            .build();
        assert!(matches!(parse(&file), Err(ParseError::Unsupported(_))));
    }

    #[test]
    fn test_ifd_loop_is_detected() {
        let mut file = CogBuilder::pyramid(512, 512, 256, 2).build();
        let first = file.ifd_offsets[0];
        file.set_next_ifd(2, first);
        assert!(matches!(parse(&file), Err(ParseError::IfdLoop(offset)) if offset == first));
    }

    #[test]
    fn test_rejects_garbage_and_truncation() {
        let garbage = CogFile {
            bytes: b"GIF89a plus some more bytes".to_vec(),
            ..CogBuilder::pyramid(64, 64, 32, 0).build()
        };
        let err = parse(&garbage).unwrap_err();
        assert!(matches!(err, ParseError::NotTiff(_)));
        assert!(!err.is_transient());

        let mut truncated = CogBuilder::pyramid(256, 256, 128, 0).build();
        truncated.bytes.truncate(20);
        let err = parse(&truncated).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Stream(StreamError::Range(RangeError::UnexpectedEof { .. }))
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_reads_only_directory_bytes() {
        let file = CogBuilder::pyramid(1024, 1024, 256, 2).build();
        let reader = file.reader();
        let probe = reader.probe();
        let config = StreamConfig {
            header_prefetch: 0,
            ..StreamConfig::uncached()
        };
        let stream = DefaultStream::open(Box::new(reader), &config).unwrap();
        let structure = parse_structure(&stream).unwrap();

        let first_tile = structure
            .levels
            .iter()
            .flat_map(|l| l.tiles.iter().map(|t| t.byte_offset))
            .min()
            .unwrap();
        assert!(probe.requests().iter().all(|r| r.end() <= first_tile));
    }
}
