//! Error types for the reader facade.

use cogstream_range::{ErrorClass, RangeError};
use cogstream_stream::StreamError;
use cogstream_tiff::ParseError;
use thiserror::Error;

use crate::CodecError;

/// Errors that can occur while reading regions of a COG.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Opening the backend failed.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// Reading through the stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The TIFF structure is invalid, or the request does not fit it.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// No codec is registered for a level's compression.
    #[error("no codec registered for compression {name} ({code})")]
    UnsupportedCompression {
        /// TIFF compression code.
        code: u16,
        /// Compression name.
        name: String,
    },

    /// The level's pixel layout cannot be composited.
    #[error("unsupported pixel layout: {0}")]
    Unsupported(String),

    /// Decoding or compositing one tile failed.
    #[error("tile ({row}, {col}) of level {level}: {source}")]
    Tile {
        /// Level index.
        level: u32,
        /// Tile row.
        row: u32,
        /// Tile column.
        col: u32,
        /// What went wrong.
        #[source]
        source: CodecError,
    },

    /// The reader was closed.
    #[error("reader is closed")]
    Closed,

    /// Invalid reader configuration.
    #[error("invalid reader configuration: {0}")]
    InvalidConfig(String),
}

impl ReaderError {
    /// Classifies this error as transient or permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReaderError::Range(e) => e.class(),
            ReaderError::Stream(e) => e.class(),
            ReaderError::Parse(e) => e.class(),
            ReaderError::UnsupportedCompression { .. }
            | ReaderError::Unsupported(_)
            | ReaderError::Tile { .. }
            | ReaderError::Closed
            | ReaderError::InvalidConfig(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if a later retry by the caller may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
