//! Tile codecs and the registry mapping compression codes to them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use cogstream_tiff::{CompressionMethod, PixelLayout, TileEntry};
use thiserror::Error;

/// Errors raised while decoding or compositing one tile.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The decoded tile does not have the size its level implies.
    #[error("decoded tile is {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Bytes the level's layout requires.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The codec rejected the tile data.
    #[error("{0}")]
    Decode(String),
}

/// What a codec knows about the tile it decodes.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// The tile's index entry.
    pub tile: &'a TileEntry,
    /// Decoded width in pixels.
    pub width: u32,
    /// Decoded height in pixels.
    pub height: u32,
    /// Pixel layout of the level.
    pub layout: &'a PixelLayout,
}

impl DecodeContext<'_> {
    /// Size of the decoded, interleaved tile in bytes.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }
}

/// Decompresses raw tile bytes into interleaved pixels.
///
/// Implementations must be callable from several threads at once.
pub trait TileCodec: Send + Sync + fmt::Debug {
    /// Human-readable codec name.
    fn name(&self) -> &str;

    /// Decode `data`, returning exactly [`DecodeContext::expected_len`] bytes.
    fn decode(&self, data: Bytes, ctx: &DecodeContext<'_>) -> Result<Bytes, CodecError>;
}

/// Pass-through codec for uncompressed tiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncompressed;

impl TileCodec for Uncompressed {
    fn name(&self) -> &str {
        "uncompressed"
    }

    fn decode(&self, data: Bytes, ctx: &DecodeContext<'_>) -> Result<Bytes, CodecError> {
        let expected = ctx.expected_len();
        if data.len() < expected {
            return Err(CodecError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        // Writers may pad the last tile or strip.
        Ok(data.slice(..expected))
    }
}

/// Codecs available to a reader, keyed by TIFF compression code.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<u16, Arc<dyn TileCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// A registry holding the uncompressed codec.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(CompressionMethod::None, Uncompressed);
        registry
    }

    /// A registry with no codecs.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register `codec` for `compression`, replacing any previous one.
    pub fn register(&mut self, compression: CompressionMethod, codec: impl TileCodec + 'static) {
        self.codecs.insert(compression.to_u16(), Arc::new(codec));
    }

    /// The codec for `compression`.
    pub fn get(&self, compression: CompressionMethod) -> Option<&Arc<dyn TileCodec>> {
        self.codecs.get(&compression.to_u16())
    }

    /// Whether a codec is registered for `compression`.
    pub fn supports(&self, compression: CompressionMethod) -> bool {
        self.codecs.contains_key(&compression.to_u16())
    }
}
