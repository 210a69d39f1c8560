//! Common error types for Periscope.

use thiserror::Error;

/// Result type alias using Periscope's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Periscope operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid values, unknown labels)
    #[error("configuration error: {0}")]
    Config(String),

    /// Media pipeline error
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Malformed or unparseable wire data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Field lookup failure in a telemetry message
    #[error("field error: {0}")]
    Field(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Remote peer reported failure
    #[error("remote error: {0}")]
    Remote(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a pipeline error from any displayable type.
    pub fn pipeline(msg: impl std::fmt::Display) -> Self {
        Self::Pipeline(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a field error from any displayable type.
    pub fn field(msg: impl std::fmt::Display) -> Self {
        Self::Field(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a remote error from any displayable type.
    pub fn remote(msg: impl std::fmt::Display) -> Self {
        Self::Remote(msg.to_string())
    }
}
