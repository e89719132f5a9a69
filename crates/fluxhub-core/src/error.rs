//! Error types for FluxHub Core

use thiserror::Error;

/// Result type alias using FluxHub Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication hub
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from disk or network operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed record framing - fatal to the affected reader
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Missing segment, lease key or peer entry - "nothing yet", not fatal
    #[error("Not found: {0}")]
    NotFound(String),

    /// Consensus service errors (transient, retried)
    #[error("Consensus error: {0}")]
    Consensus(String),

    /// Bad handshake, magic or command arity
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Binlog writer/reader lifecycle errors
    #[error("Binlog error: {0}")]
    Binlog(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a consensus error
    pub fn consensus(msg: impl Into<String>) -> Self {
        Self::Consensus(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a binlog error
    pub fn binlog(msg: impl Into<String>) -> Self {
        Self::Binlog(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error should be treated as a retryable I/O failure
    /// by the per-peer forwarding loops.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
