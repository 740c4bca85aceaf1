//! Error types for stream reads.

use std::sync::Arc;

use cogstream_range::{ErrorClass, RangeError};
use thiserror::Error;

/// Errors that can occur while reading through a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A backend call made outside the block cache failed.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// A block fetch failed. The error is shared with every caller that
    /// waited on the same fetch.
    #[error(transparent)]
    Fetch(Arc<RangeError>),

    /// Seek to a position below the stream floor.
    #[error("cannot seek to {position}: below stream floor {floor}")]
    SeekBelowFloor {
        /// Requested position.
        position: u64,
        /// Current floor.
        floor: u64,
    },

    /// The stream was closed.
    #[error("stream is closed")]
    Closed,

    /// A cached block did not cover the bytes it was expected to hold.
    #[error("block {index} holds {available} bytes, needed {offset}..{end}")]
    BlockBounds {
        /// Block index.
        index: u64,
        /// Start offset within the block.
        offset: usize,
        /// End offset within the block.
        end: usize,
        /// Bytes held by the block.
        available: usize,
    },

    /// Invalid stream configuration.
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),
}

impl StreamError {
    /// Classifies this error as transient or permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            StreamError::Range(e) => e.class(),
            StreamError::Fetch(e) => e.class(),
            StreamError::SeekBelowFloor { .. }
            | StreamError::Closed
            | StreamError::BlockBounds { .. }
            | StreamError::InvalidConfig(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if a later retry by the caller may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// The underlying range error, whether owned or shared.
    pub fn range_error(&self) -> Option<&RangeError> {
        match self {
            StreamError::Range(e) => Some(e),
            StreamError::Fetch(e) => Some(e),
            _ => None,
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        StreamError::InvalidConfig(message.into())
    }
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err.range_error() {
            Some(RangeError::UnexpectedEof { .. }) => std::io::ErrorKind::UnexpectedEof,
            Some(RangeError::NotFound(_)) => std::io::ErrorKind::NotFound,
            Some(RangeError::AccessDenied(_)) => std::io::ErrorKind::PermissionDenied,
            _ if matches!(err, StreamError::SeekBelowFloor { .. }) => {
                std::io::ErrorKind::InvalidInput
            }
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_fetch_error_keeps_class() {
        let transient = StreamError::Fetch(Arc::new(RangeError::Status {
            status: 503,
            location: "mem://a".into(),
        }));
        assert!(transient.is_transient());

        let permanent = StreamError::Fetch(Arc::new(RangeError::NotFound("mem://a".into())));
        assert_eq!(permanent.class(), ErrorClass::Permanent);
        assert_eq!(permanent.to_string(), "object not found: mem://a");
    }

    #[test]
    fn test_io_conversion() {
        let err: std::io::Error = StreamError::Range(RangeError::UnexpectedEof {
            offset: 0,
            requested: 10,
            available: 5,
        })
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let err: std::io::Error = StreamError::SeekBelowFloor {
            position: 1,
            floor: 2,
        }
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
