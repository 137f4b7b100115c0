//! Common error types for codec and payload handling

use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while decoding frames or broker payloads
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Datagram did not have the fixed frame size
    #[error("Frame must be {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    /// Body could not be deserialized at all
    #[error("Malformed body: {0}")]
    MalformedBody(String),

    /// Body deserialized but did not satisfy the named schema
    #[error("Schema violation ({schema}): {reason}")]
    SchemaViolation { schema: &'static str, reason: String },

    /// Address field was not a valid IPv4 address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl CoreError {
    /// Create a schema violation for the given schema name
    pub fn violation(schema: &'static str, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            schema,
            reason: reason.into(),
        }
    }
}
