//! Error types for covalence core.

use thiserror::Error;

/// Core errors (crypto, encoding, identifiers).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Validation errors raised while appending to a session log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("signature verification failed for session {session}")]
    SignatureMismatch { session: String },

    #[error("gap in session {session}: expected index {expected}, got {got}")]
    Gap {
        session: String,
        expected: u32,
        got: u32,
    },

    #[error("header does not hash to {0}")]
    HeaderMismatch(String),

    #[error("empty transaction batch")]
    EmptyBatch,

    #[error("signing key does not belong to session {0}")]
    ForeignSession(String),
}
