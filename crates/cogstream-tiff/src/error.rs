//! Error types for structural parsing and tile planning.

use cogstream_range::ErrorClass;
use cogstream_stream::StreamError;
use thiserror::Error;

/// Errors that can occur while parsing a TIFF structure or planning reads.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Reading the directory bytes failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The object does not start with a TIFF or BigTIFF header.
    #[error("not a TIFF file: {0}")]
    NotTiff(String),

    /// A directory or value is structurally invalid.
    #[error("malformed TIFF: {0}")]
    Malformed(String),

    /// A directory lacks a tag needed to locate its pixels.
    #[error("IFD {ifd} is missing required tag {tag}")]
    MissingTag {
        /// Position of the directory in the IFD chain.
        ifd: usize,
        /// Tag name.
        tag: &'static str,
    },

    /// The file uses a layout this parser does not handle.
    #[error("unsupported TIFF layout: {0}")]
    Unsupported(String),

    /// The IFD chain points back to a directory already visited.
    #[error("IFD chain loops back to offset {0}")]
    IfdLoop(u64),

    /// No directory describes an image.
    #[error("no image levels found")]
    NoLevels,

    /// A level index past the last level.
    #[error("level {level} out of range, {available} levels available")]
    LevelOutOfRange {
        /// Requested level.
        level: usize,
        /// Number of levels.
        available: usize,
    },

    /// A region or subsampling that cannot be planned.
    #[error("invalid region: {0}")]
    InvalidRegion(String),
}

impl ParseError {
    /// Classifies this error as transient or permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            ParseError::Stream(e) => e.class(),
            _ => ErrorClass::Permanent,
        }
    }

    /// Returns true if a later retry by the caller may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ParseError::Malformed(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        ParseError::Unsupported(message.into())
    }
}
