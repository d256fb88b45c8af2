//! Error types for container I/O operations.

use bstr::BString;
use thiserror::Error;

/// Result type alias for container operations
pub type Result<T> = std::result::Result<T, VpkgError>;

/// Error type for container operations
#[derive(Error, Debug)]
pub enum VpkgError {
    /// A seekable BGZF input ends without the EOF sentinel block
    #[error("BGZF input has been truncated and is missing its EOF marker block")]
    TruncatedContainer,

    /// The framing of a group or item could not be decoded
    #[error("malformed frame at virtual offset {offset}: {reason}")]
    MalformedFrame {
        /// Virtual offset of the group (or item) that failed to decode,
        /// or a synthetic group counter when the input is untellable
        offset: i64,
        /// Explanation of the problem
        reason: String,
    },

    /// The first group of a stream carries a tag other than the expected one
    #[error("unexpected tag '{found}' at start of stream (expected '{expected}')")]
    UnexpectedTag {
        /// The tag the caller asked for
        expected: BString,
        /// The tag actually present
        found: BString,
    },

    /// No registered loader or bare sniffer can produce the requested type
    #[error("input does not contain a loadable {type_name}")]
    UnknownType {
        /// Human-readable name of the requested type
        type_name: &'static str,
    },

    /// The underlying byte stream failed
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The caller violated an API precondition
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl VpkgError {
    /// Build a [`VpkgError::MalformedFrame`] with the offending offset.
    pub fn malformed(offset: i64, reason: impl Into<String>) -> Self {
        VpkgError::MalformedFrame { offset, reason: reason.into() }
    }
}
