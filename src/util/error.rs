//! Error types for the AVV streaming core.

use thiserror::Error;

/// Coarse grouping of [`Error`] variants by the stage that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Container could not be opened (fatal for that container).
    Open,
    /// A segment, frame or meta sub-container is truncated or corrupt.
    Parse,
    /// A storage read failed or a request was malformed.
    Request,
    /// The decoder expected data that is not in the cache.
    Decoder,
    Other,
}

/// Main error type for AVV operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid magic bytes at start of file
    #[error("Invalid AVV file: bad magic bytes {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported container version
    #[error("Unsupported AVV version {major}.{minor}", major = .0 >> 16, minor = .0 & 0xFFFF)]
    UnsupportedVersion(u32),

    /// Operation needs an opened container
    #[error("Reader has no open container")]
    NotOpen,

    /// Buffer ended before the advertised data
    #[error("Unexpected end of data: need {needed} bytes at offset {offset}, have {available}")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Invalid data structure in a container
    #[error("Invalid container structure: {0}")]
    InvalidStructure(String),

    /// A count exceeds the header limits
    #[error("{what} count {value} exceeds limit {limit}")]
    LimitExceeded {
        what: &'static str,
        value: u32,
        limit: u32,
    },

    /// Segment or frame index outside the container
    #[error("{what} index {index} out of range (count: {count})")]
    IndexOutOfRange {
        what: &'static str,
        index: u32,
        count: u32,
    },

    /// Storage read reported failure
    #[error("Read of {len} bytes at offset {offset} failed: {reason}")]
    ReadFailed {
        offset: u64,
        len: usize,
        reason: String,
    },

    /// Cached data the decoder relied on is gone
    #[error("Missing {what} {index} in data cache")]
    MissingData { what: &'static str, index: u32 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings (de)serialization error
    #[error("Settings error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid structure error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidStructure(msg.into())
    }

    /// Create an end-of-data error for a read of `needed` bytes at `offset`.
    pub fn eof(offset: usize, needed: usize, available: usize) -> Self {
        Self::UnexpectedEof {
            offset,
            needed,
            available,
        }
    }

    /// Stage this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMagic(_) | Self::UnsupportedVersion(_) | Self::NotOpen => ErrorKind::Open,
            Self::UnexpectedEof { .. } | Self::InvalidStructure(_) | Self::LimitExceeded { .. } => {
                ErrorKind::Parse
            }
            Self::IndexOutOfRange { .. } | Self::ReadFailed { .. } | Self::Io(_) => {
                ErrorKind::Request
            }
            Self::MissingData { .. } => ErrorKind::Decoder,
            Self::Json(_) | Self::Other(_) => ErrorKind::Other,
        }
    }
}

/// Result type alias for AVV operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::UnsupportedVersion((1 << 16) | 2);
        assert!(e.to_string().contains("1.2"));

        let e = Error::IndexOutOfRange {
            what: "frame",
            index: 12,
            count: 3,
        };
        assert!(e.to_string().contains("12"));
        assert!(e.to_string().contains("3"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::InvalidMagic(*b"XXXX").kind(), ErrorKind::Open);
        assert_eq!(Error::eof(4, 8, 6).kind(), ErrorKind::Parse);
        assert_eq!(
            Error::MissingData {
                what: "segment",
                index: 0
            }
            .kind(),
            ErrorKind::Decoder
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Request);
    }
}
