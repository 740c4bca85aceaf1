//! Output raster and tile compositing.

use cogstream_tiff::PlannedTile;

use crate::CodecError;

/// Interleaved pixels of one region read, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    data: Vec<u8>,
    skipped_tiles: Vec<(u32, u32)>,
}

impl RasterBuffer {
    /// A `width` x `height` raster with every byte set to `fill`.
    pub fn filled(width: u32, height: u32, bytes_per_pixel: usize, fill: u8) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
            data: vec![fill; width as usize * height as usize * bytes_per_pixel],
            skipped_tiles: Vec::new(),
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per interleaved pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    /// Bytes of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y as usize * self.width as usize + x as usize) * self.bytes_per_pixel;
        self.data.get(start..start + self.bytes_per_pixel)
    }

    /// All pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the raster, returning its pixel bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// `(row, col)` of tiles left unfilled because they failed.
    pub fn skipped_tiles(&self) -> &[(u32, u32)] {
        &self.skipped_tiles
    }

    pub(crate) fn skip(&mut self, row: u32, col: u32) {
        self.skipped_tiles.push((row, col));
    }

    /// Copy the sampled pixels of one decoded tile into place.
    ///
    /// `pixels` holds the tile decoded at `decoded_width` pixels per row.
    /// Both buffers are bounds-checked before anything is written, so a
    /// failed tile leaves the raster untouched.
    pub(crate) fn composite(
        &mut self,
        planned: &PlannedTile,
        pixels: &[u8],
        decoded_width: u32,
        subsample_x: u32,
        subsample_y: u32,
    ) -> Result<(), CodecError> {
        if planned.columns == 0 || planned.rows == 0 {
            return Ok(());
        }
        let bpp = self.bytes_per_pixel;
        let stride = decoded_width as usize * bpp;
        let (sx, sy) = (subsample_x as usize, subsample_y as usize);
        let (columns, rows) = (planned.columns as usize, planned.rows as usize);

        let last_src_row = planned.src_y as usize + (rows - 1) * sy;
        let last_src_col = planned.src_x as usize + (columns - 1) * sx;
        let src_end = last_src_row * stride + (last_src_col + 1) * bpp;
        if last_src_col >= decoded_width as usize || src_end > pixels.len() {
            return Err(CodecError::SizeMismatch {
                expected: src_end.max((last_src_col + 1) * bpp),
                actual: pixels.len(),
            });
        }
        let out_row = self.width as usize * bpp;
        let dest_end = planned.dest_offset * bpp + (rows - 1) * out_row + columns * bpp;
        if planned.dest_x as usize + columns > self.width as usize || dest_end > self.data.len() {
            return Err(CodecError::SizeMismatch {
                expected: dest_end,
                actual: self.data.len(),
            });
        }

        for r in 0..rows {
            let src_row = (planned.src_y as usize + r * sy) * stride + planned.src_x as usize * bpp;
            let dest_row = planned.dest_offset * bpp + r * out_row;
            if sx == 1 {
                let len = columns * bpp;
                self.data[dest_row..dest_row + len].copy_from_slice(&pixels[src_row..src_row + len]);
            } else {
                for c in 0..columns {
                    let src = src_row + c * sx * bpp;
                    let dest = dest_row + c * bpp;
                    self.data[dest..dest + bpp].copy_from_slice(&pixels[src..src + bpp]);
                }
            }
        }
        Ok(())
    }
}
