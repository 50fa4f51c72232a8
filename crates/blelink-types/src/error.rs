//! Error types for value decoding in blelink-types.

use thiserror::Error;

/// Errors that can occur when decoding blelink value types.
///
/// This error type is platform-agnostic and does not include
/// transport or lifecycle errors (those belong in blelink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Input had the wrong number of bytes.
    #[error("expected {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Required byte count.
        expected: usize,
        /// Byte count received.
        actual: usize,
    },

    /// Input was well-sized but held an unusable value.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using blelink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
