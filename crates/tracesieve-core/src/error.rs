//! Error types shared by tracesieve components.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling decoded trace events.
#[derive(Error, Debug)]
pub enum Error {
    /// A field of an encoded event or index has an invalid format.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// A timestamp is outside the representable range.
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i128),

    /// An encoded line does not have the expected number of parts.
    #[error("malformed line: expected {expected} fields, found {found}")]
    MalformedLine {
        /// Number of fields required by the format.
        expected: usize,
        /// Number of fields actually present.
        found: usize,
    },
}
