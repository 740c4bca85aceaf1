//! Error types for range reads.

use std::io::ErrorKind;

use thiserror::Error;

/// Whether an error may go away if the caller retries later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeout, connection reset, 5xx-equivalent. Retried locally first.
    Transient,
    /// Not found, access denied, short read, malformed data. Never retried.
    Permanent,
}

impl ErrorClass {
    /// Returns the class as a lowercase string (used as a metric label).
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while reading a byte range.
#[derive(Debug, Error)]
pub enum RangeError {
    /// A transient failure persisted through every local retry attempt.
    #[error("{location}: gave up after {attempts} attempts: {last}")]
    Transient {
        /// Object being read.
        location: String,
        /// Number of attempts made.
        attempts: u32,
        /// The failure observed on the final attempt.
        #[source]
        last: Box<RangeError>,
    },

    /// The remote object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The backend refused access to the object.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The requested range extends past the end of the object.
    #[error("read past end of object: offset {offset} + {requested} bytes, object is {available} bytes")]
    UnexpectedEof {
        /// Requested start offset.
        offset: u64,
        /// Requested length.
        requested: u64,
        /// Total object length.
        available: u64,
    },

    /// The backend returned fewer bytes than requested before the end of the object.
    #[error("short read at offset {offset}: requested {requested} bytes, received {received}")]
    ShortRead {
        /// Requested start offset.
        offset: u64,
        /// Requested length.
        requested: u64,
        /// Bytes actually received.
        received: u64,
    },

    /// The reader was closed.
    #[error("range reader is closed")]
    Closed,

    /// The connection descriptor could not be used.
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// A non-success HTTP status not covered by a more specific variant.
    #[error("HTTP {status} from {location}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Object being read.
        location: String,
    },

    /// Malformed response from the backend (bad headers, unparsable length).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RangeError {
    /// Classifies this error as transient or permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            RangeError::Transient { .. } => ErrorClass::Transient,
            RangeError::Status { status, .. } => {
                if *status >= 500 || *status == 408 || *status == 429 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            RangeError::Io(e) => match e.kind() {
                ErrorKind::TimedOut
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            RangeError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            RangeError::NotFound(_)
            | RangeError::AccessDenied(_)
            | RangeError::UnexpectedEof { .. }
            | RangeError::ShortRead { .. }
            | RangeError::Closed
            | RangeError::InvalidDescriptor(_)
            | RangeError::Protocol(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if a later retry by the caller may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(message: impl Into<String>) -> Self {
        RangeError::InvalidDescriptor(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        RangeError::Protocol(message.into())
    }

    /// Map a local I/O error, promoting not-found and permission errors.
    pub(crate) fn from_io(location: &str, err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => RangeError::NotFound(location.to_string()),
            ErrorKind::PermissionDenied => RangeError::AccessDenied(location.to_string()),
            _ => RangeError::Io(err),
        }
    }
}
