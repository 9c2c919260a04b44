//! Error types for kernel bridge operations

use thiserror::Error;

/// Bridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Wire message signature did not match; the message is discarded but the
    /// connection stays open.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Connecting to the kernel failed, or an established channel died.
    /// Fatal to the operation that observes it.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Sustained heartbeat loss. Non-fatal; the caller decides whether to
    /// retry or restart.
    #[error("Kernel unresponsive: {0}")]
    KernelUnresponsive(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid parameter: {0}")]
    InvalidParams(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Convenience result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;
