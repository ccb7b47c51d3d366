//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An I/O operation kept failing after every retry allowed by its policy.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Description of the operation that was retried.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The error returned by the last attempt.
        #[source]
        source: std::io::Error,
    },

    /// A filter rule could not be parsed.
    #[error("invalid filter rule '{rule}': {reason}")]
    FilterRule {
        /// The offending rule text.
        rule: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A sink failed to accept events.
    #[error("sink '{sink}' failed: {reason}")]
    Sink {
        /// Name of the sink.
        sink: String,
        /// Description of the failure.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_rule_display() {
        let err = Error::FilterRule {
            rule: "*.Open:3".to_string(),
            reason: "wildcard task requires wildcard event type".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("*.Open:3"));
        assert!(msg.contains("wildcard task"));
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = Error::RetriesExhausted {
            operation: "write bookmark".to_string(),
            attempts: 3,
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
        };
        assert_eq!(
            err.to_string(),
            "write bookmark failed after 3 attempts: locked"
        );
    }
}
