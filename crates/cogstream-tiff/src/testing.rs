//! Writer for small synthetic COG files.
//!
//! Files are laid out the way cloud-optimized GeoTIFFs are: header, then
//! every IFD with its out-of-line values, then tile data in level order.
//! Tiles are stored uncompressed whatever compression code is declared,
//! and every pixel byte is [`sample_value`] of its position so tests can
//! compute the expected contents of any region.

use cogstream_range::MemoryRangeReader;

use crate::ifd::ByteOrder;
use crate::Region;

/// Byte written to tile padding beyond the image edge.
pub const PAD_BYTE: u8 = 0xEE;

/// Byte `byte` of pixel `(x, y)` in the level added at position `level`.
pub fn sample_value(level: usize, x: u32, y: u32, byte: usize) -> u8 {
    ((x as u64 * 3 + y as u64 * 7 + byte as u64 * 11 + level as u64 * 29) % 251) as u8
}

/// Role of a directory in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubfileKind {
    /// Full-resolution image, no `NewSubfileType` tag.
    Primary,
    /// Reduced-resolution image (`NewSubfileType` = 1).
    Overview,
    /// Transparency mask (`NewSubfileType` = 4).
    Mask,
    /// Another page of a multi-page file (`NewSubfileType` = 2).
    Page,
}

/// One directory to write.
#[derive(Debug, Clone)]
pub struct LevelSpec {
    /// Image width.
    pub width: u32,
    /// Image height.
    pub height: u32,
    /// Tile width, ignored for strips.
    pub tile_width: u32,
    /// Tile height, or rows per strip.
    pub tile_height: u32,
    /// Write strips instead of tiles.
    pub stripped: bool,
    /// Samples per pixel.
    pub samples_per_pixel: u16,
    /// Bits per sample, a multiple of 8.
    pub bits_per_sample: u16,
    /// Declared compression code.
    pub compression: u16,
    /// Declared planar configuration.
    pub planar: u16,
    /// Role of the directory.
    pub kind: SubfileKind,
    /// Tiles written with a zero byte count.
    pub sparse: Vec<(u32, u32)>,
    /// `JPEGTables` value, if any.
    pub jpeg_tables: Option<Vec<u8>>,
}

impl LevelSpec {
    /// A tiled 8-bit single-band image.
    pub fn tiled(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            width,
            height,
            tile_width,
            tile_height,
            stripped: false,
            samples_per_pixel: 1,
            bits_per_sample: 8,
            compression: 1,
            planar: 1,
            kind: SubfileKind::Primary,
            sparse: Vec::new(),
            jpeg_tables: None,
        }
    }

    /// A stripped 8-bit single-band image.
    pub fn stripped(width: u32, height: u32, rows_per_strip: u32) -> Self {
        Self {
            stripped: true,
            ..Self::tiled(width, height, width, rows_per_strip)
        }
    }

    /// Mark as a reduced-resolution overview.
    pub fn overview(mut self) -> Self {
        self.kind = SubfileKind::Overview;
        self
    }

    /// Mark as a transparency mask.
    pub fn mask(mut self) -> Self {
        self.kind = SubfileKind::Mask;
        self
    }

    /// Mark as an extra page.
    pub fn page(mut self) -> Self {
        self.kind = SubfileKind::Page;
        self
    }

    /// Set samples per pixel and bits per sample.
    pub fn samples(mut self, samples_per_pixel: u16, bits_per_sample: u16) -> Self {
        self.samples_per_pixel = samples_per_pixel;
        self.bits_per_sample = bits_per_sample;
        self
    }

    /// Declare a compression code.
    pub fn compression(mut self, code: u16) -> Self {
        self.compression = code;
        self
    }

    /// Declare a planar configuration.
    pub fn planar(mut self, planar: u16) -> Self {
        self.planar = planar;
        self
    }

    /// Leave tile `(row, col)` empty.
    pub fn sparse(mut self, row: u32, col: u32) -> Self {
        self.sparse.push((row, col));
        self
    }

    /// Attach `JPEGTables`.
    pub fn jpeg_tables(mut self, tables: Vec<u8>) -> Self {
        self.jpeg_tables = Some(tables);
        self
    }

    /// Bytes per interleaved pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        self.samples_per_pixel as usize * (self.bits_per_sample as usize).div_ceil(8)
    }

    fn grid(&self) -> (u32, u32) {
        if self.stripped {
            (1, self.height.div_ceil(self.tile_height))
        } else {
            (
                self.width.div_ceil(self.tile_width),
                self.height.div_ceil(self.tile_height),
            )
        }
    }

    fn subfile_type(&self) -> Option<u32> {
        match self.kind {
            SubfileKind::Primary => None,
            SubfileKind::Overview => Some(1),
            SubfileKind::Page => Some(2),
            SubfileKind::Mask => Some(4),
        }
    }

    /// Uncompressed bytes of tile `(row, col)` of the level at `position`.
    fn tile_bytes(&self, position: usize, row: u32, col: u32) -> Vec<u8> {
        let bpp = self.bytes_per_pixel();
        let (width, rows) = if self.stripped {
            let top = row * self.tile_height;
            (self.width, self.tile_height.min(self.height - top))
        } else {
            (self.tile_width, self.tile_height)
        };

        let mut out = Vec::with_capacity(width as usize * rows as usize * bpp);
        for ty in 0..rows {
            for tx in 0..width {
                let x = col * self.tile_width + tx;
                let y = row * self.tile_height + ty;
                for byte in 0..bpp {
                    if x < self.width && y < self.height {
                        out.push(sample_value(position, x, y, byte));
                    } else {
                        out.push(PAD_BYTE);
                    }
                }
            }
        }
        out
    }
}

enum Value {
    Short(Vec<u16>),
    Long(Vec<u32>),
    Long8(Vec<u64>),
    Undefined(Vec<u8>),
}

impl Value {
    fn type_code(&self) -> u16 {
        match self {
            Value::Short(_) => 3,
            Value::Long(_) => 4,
            Value::Long8(_) => 16,
            Value::Undefined(_) => 7,
        }
    }

    fn count(&self) -> u64 {
        match self {
            Value::Short(v) => v.len() as u64,
            Value::Long(v) => v.len() as u64,
            Value::Long8(v) => v.len() as u64,
            Value::Undefined(v) => v.len() as u64,
        }
    }

    fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Value::Short(values) => values.iter().for_each(|v| put_u16(&mut out, order, *v)),
            Value::Long(values) => values.iter().for_each(|v| put_u32(&mut out, order, *v)),
            Value::Long8(values) => values.iter().for_each(|v| put_u64(&mut out, order, *v)),
            Value::Undefined(values) => out.extend_from_slice(values),
        }
        out
    }
}

fn put_u16(out: &mut Vec<u8>, order: ByteOrder, v: u16) {
    match order {
        ByteOrder::LittleEndian => out.extend_from_slice(&v.to_le_bytes()),
        ByteOrder::BigEndian => out.extend_from_slice(&v.to_be_bytes()),
    }
}

fn put_u32(out: &mut Vec<u8>, order: ByteOrder, v: u32) {
    match order {
        ByteOrder::LittleEndian => out.extend_from_slice(&v.to_le_bytes()),
        ByteOrder::BigEndian => out.extend_from_slice(&v.to_be_bytes()),
    }
}

fn put_u64(out: &mut Vec<u8>, order: ByteOrder, v: u64) {
    match order {
        ByteOrder::LittleEndian => out.extend_from_slice(&v.to_le_bytes()),
        ByteOrder::BigEndian => out.extend_from_slice(&v.to_be_bytes()),
    }
}

/// A written file plus the positions tests may want to patch.
#[derive(Debug, Clone)]
pub struct CogFile {
    /// File contents.
    pub bytes: Vec<u8>,
    /// Offset of each IFD, in the order the levels were added.
    pub ifd_offsets: Vec<u64>,
    /// Offset of each IFD's next-IFD pointer.
    pub next_pointers: Vec<u64>,
    /// Byte order used.
    pub byte_order: ByteOrder,
    /// Whether the file is BigTIFF.
    pub bigtiff: bool,
    /// The levels as written.
    pub levels: Vec<LevelSpec>,
}

impl CogFile {
    /// An in-memory reader serving the file.
    pub fn reader(&self) -> MemoryRangeReader {
        MemoryRangeReader::named("mem://synthetic.tif", self.bytes.clone())
    }

    /// Point IFD `ifd`'s next pointer at `target`.
    pub fn set_next_ifd(&mut self, ifd: usize, target: u64) {
        let at = self.next_pointers[ifd] as usize;
        let mut encoded = Vec::new();
        if self.bigtiff {
            put_u64(&mut encoded, self.byte_order, target);
        } else {
            put_u32(&mut encoded, self.byte_order, target as u32);
        }
        self.bytes[at..at + encoded.len()].copy_from_slice(&encoded);
    }

    /// Expected interleaved pixels of `region` of the level added at
    /// `position`, sampling every `sx`-th column and `sy`-th row.
    pub fn expected_region(&self, position: usize, region: Region, sx: u32, sy: u32) -> Vec<u8> {
        let bpp = self.levels[position].bytes_per_pixel();
        let mut out = Vec::new();
        for y in (region.y..region.y + region.height).step_by(sy as usize) {
            for x in (region.x..region.x + region.width).step_by(sx as usize) {
                for byte in 0..bpp {
                    out.push(sample_value(position, x, y, byte));
                }
            }
        }
        out
    }
}

/// Builds synthetic TIFF and BigTIFF files.
#[derive(Debug, Clone)]
pub struct CogBuilder {
    byte_order: ByteOrder,
    bigtiff: bool,
    levels: Vec<LevelSpec>,
}

impl Default for CogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CogBuilder {
    /// Little-endian classic TIFF with no levels.
    pub fn new() -> Self {
        Self {
            byte_order: ByteOrder::LittleEndian,
            bigtiff: false,
            levels: Vec::new(),
        }
    }

    /// Set the byte order.
    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Write BigTIFF instead of classic TIFF.
    pub fn bigtiff(mut self, bigtiff: bool) -> Self {
        self.bigtiff = bigtiff;
        self
    }

    /// Append a directory.
    pub fn level(mut self, spec: LevelSpec) -> Self {
        self.levels.push(spec);
        self
    }

    /// A COG with a full-resolution level and the given overviews, each
    /// tiled at `tile` by `tile`.
    pub fn pyramid(width: u32, height: u32, tile: u32, overviews: u32) -> Self {
        let mut builder = Self::new().level(LevelSpec::tiled(width, height, tile, tile));
        for i in 1..=overviews {
            builder = builder.level(
                LevelSpec::tiled((width >> i).max(1), (height >> i).max(1), tile, tile).overview(),
            );
        }
        builder
    }

    fn header_len(&self) -> u64 {
        if self.bigtiff {
            16
        } else {
            8
        }
    }

    fn inline_size(&self) -> usize {
        if self.bigtiff {
            8
        } else {
            4
        }
    }

    fn entries(&self, spec: &LevelSpec, offsets: &[u64], counts: &[u64]) -> Vec<(u16, Value)> {
        let spp = spec.samples_per_pixel as usize;
        let array = |values: &[u64]| {
            if self.bigtiff {
                Value::Long8(values.to_vec())
            } else {
                Value::Long(values.iter().map(|v| *v as u32).collect())
            }
        };

        let mut entries = Vec::new();
        if let Some(subfile) = spec.subfile_type() {
            entries.push((254, Value::Long(vec![subfile])));
        }
        entries.push((256, Value::Long(vec![spec.width])));
        entries.push((257, Value::Long(vec![spec.height])));
        entries.push((258, Value::Short(vec![spec.bits_per_sample; spp])));
        entries.push((259, Value::Short(vec![spec.compression])));
        entries.push((262, Value::Short(vec![if spp == 1 { 1 } else { 2 }])));
        if spec.stripped {
            entries.push((273, array(offsets)));
        }
        entries.push((277, Value::Short(vec![spec.samples_per_pixel])));
        if spec.stripped {
            entries.push((278, Value::Long(vec![spec.tile_height])));
            entries.push((279, array(counts)));
        }
        entries.push((284, Value::Short(vec![spec.planar])));
        if !spec.stripped {
            entries.push((322, Value::Long(vec![spec.tile_width])));
            entries.push((323, Value::Long(vec![spec.tile_height])));
            entries.push((324, array(offsets)));
            entries.push((325, array(counts)));
        }
        entries.push((339, Value::Short(vec![1; spp])));
        if let Some(tables) = &spec.jpeg_tables {
            entries.push((347, Value::Undefined(tables.clone())));
        }
        entries
    }

    /// Bytes taken by one IFD including its out-of-line values.
    fn ifd_len(&self, entries: &[(u16, Value)]) -> u64 {
        let (count, entry, next) = if self.bigtiff { (8, 20, 8) } else { (2, 12, 4) };
        let extra: u64 = entries
            .iter()
            .map(|(_, value)| value.encode(self.byte_order).len())
            .filter(|len| *len > self.inline_size())
            .map(|len| len.next_multiple_of(2) as u64)
            .sum();
        count + entries.len() as u64 * entry + next + extra
    }

    /// Write the file.
    pub fn build(self) -> CogFile {
        let order = self.byte_order;

        let blobs: Vec<Vec<Vec<u8>>> = self
            .levels
            .iter()
            .enumerate()
            .map(|(position, spec)| {
                let (across, down) = spec.grid();
                (0..down)
                    .flat_map(|row| (0..across).map(move |col| (row, col)))
                    .map(|(row, col)| {
                        if spec.sparse.contains(&(row, col)) {
                            Vec::new()
                        } else {
                            spec.tile_bytes(position, row, col)
                        }
                    })
                    .collect()
            })
            .collect();

        // Directory sizes do not depend on the offset values they hold.
        let mut ifd_offsets = Vec::with_capacity(self.levels.len());
        let mut pos = self.header_len();
        for (spec, tiles) in self.levels.iter().zip(&blobs) {
            let zeros = vec![0u64; tiles.len()];
            ifd_offsets.push(pos);
            pos += self.ifd_len(&self.entries(spec, &zeros, &zeros));
        }

        let mut tile_offsets = Vec::with_capacity(blobs.len());
        for tiles in &blobs {
            let mut offsets = Vec::with_capacity(tiles.len());
            for tile in tiles {
                if tile.is_empty() {
                    offsets.push(0);
                } else {
                    offsets.push(pos);
                    pos += tile.len() as u64;
                }
            }
            tile_offsets.push(offsets);
        }

        let mut bytes = Vec::with_capacity(pos as usize);
        match order {
            ByteOrder::LittleEndian => bytes.extend_from_slice(b"II"),
            ByteOrder::BigEndian => bytes.extend_from_slice(b"MM"),
        }
        let first_ifd = ifd_offsets.first().copied().unwrap_or(0);
        if self.bigtiff {
            put_u16(&mut bytes, order, 43);
            put_u16(&mut bytes, order, 8);
            put_u16(&mut bytes, order, 0);
            put_u64(&mut bytes, order, first_ifd);
        } else {
            put_u16(&mut bytes, order, 42);
            put_u32(&mut bytes, order, first_ifd as u32);
        }

        let mut next_pointers = Vec::with_capacity(self.levels.len());
        for (i, spec) in self.levels.iter().enumerate() {
            let counts: Vec<u64> = blobs[i].iter().map(|t| t.len() as u64).collect();
            let mut entries = self.entries(spec, &tile_offsets[i], &counts);
            entries.sort_by_key(|(tag, _)| *tag);

            let start = ifd_offsets[i];
            debug_assert_eq!(bytes.len() as u64, start);
            let entry_size = if self.bigtiff { 20 } else { 12 };
            let count_size = if self.bigtiff { 8 } else { 2 };
            let mut extra_at = start
                + count_size
                + entries.len() as u64 * entry_size
                + self.inline_size() as u64;
            let mut extra = Vec::new();

            if self.bigtiff {
                put_u64(&mut bytes, order, entries.len() as u64);
            } else {
                put_u16(&mut bytes, order, entries.len() as u16);
            }
            for (tag, value) in &entries {
                put_u16(&mut bytes, order, *tag);
                put_u16(&mut bytes, order, value.type_code());
                if self.bigtiff {
                    put_u64(&mut bytes, order, value.count());
                } else {
                    put_u32(&mut bytes, order, value.count() as u32);
                }
                let mut encoded = value.encode(order);
                if encoded.len() <= self.inline_size() {
                    encoded.resize(self.inline_size(), 0);
                    bytes.extend_from_slice(&encoded);
                } else {
                    if self.bigtiff {
                        put_u64(&mut bytes, order, extra_at);
                    } else {
                        put_u32(&mut bytes, order, extra_at as u32);
                    }
                    let padded = encoded.len().next_multiple_of(2);
                    encoded.resize(padded, 0);
                    extra_at += padded as u64;
                    extra.extend_from_slice(&encoded);
                }
            }

            next_pointers.push(bytes.len() as u64);
            let next = ifd_offsets.get(i + 1).copied().unwrap_or(0);
            if self.bigtiff {
                put_u64(&mut bytes, order, next);
            } else {
                put_u32(&mut bytes, order, next as u32);
            }
            bytes.extend_from_slice(&extra);
        }

        for tiles in &blobs {
            for tile in tiles {
                bytes.extend_from_slice(tile);
            }
        }

        CogFile {
            bytes,
            ifd_offsets,
            next_pointers,
            byte_order: order,
            bigtiff: self.bigtiff,
            levels: self.levels,
        }
    }
}
