//! Error types for the permissions module.

use thiserror::Error;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Decrypted key material does not match the key id it was filed under.
    #[error("key id mismatch: expected {expected}")]
    KeyMismatch { expected: String },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("core error: {0}")]
    CoreError(#[from] covalence_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
