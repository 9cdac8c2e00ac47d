//! Error types for shared event and resource types.

use thiserror::Error;

/// Errors raised while parsing shared types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A device kind string was not `cpu`, `gpu`, or `gpu:<class>`.
    #[error("invalid device kind: {0}")]
    InvalidDeviceKind(String),

    /// A log level string was not recognised.
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// An output stream string was not `stdout` or `stderr`.
    #[error("invalid stdtype: {0}")]
    InvalidStdType(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
