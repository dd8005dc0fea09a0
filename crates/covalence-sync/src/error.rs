//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A frame could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] covalence_store::StoreError),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Reconnecting gave up.
    #[error("gave up after {0} connection attempts")]
    GaveUp(u32),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
