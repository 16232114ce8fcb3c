//! Common error types for the service registry components.

use std::fmt;

/// A specialized Result type for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Timer fault: {0}")]
    Timer(String),
}

impl Error {
    /// Create a new not-found error for the given service id.
    pub fn not_found(id: impl fmt::Display) -> Self {
        Error::NotFound(id.to_string())
    }

    /// Create a new invalid input error.
    pub fn invalid_input(msg: impl fmt::Display) -> Self {
        Error::InvalidInput(msg.to_string())
    }

    /// Create a new probe error.
    pub fn probe(msg: impl fmt::Display) -> Self {
        Error::Probe(msg.to_string())
    }

    /// Create a new timer fault.
    pub fn timer(msg: impl fmt::Display) -> Self {
        Error::Timer(msg.to_string())
    }

    /// Whether this error means the referenced service does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
