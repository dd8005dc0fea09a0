//! Error types for the local node.

use covalence_core::{CoValueId, CoreError, SessionId, ValidationError};
use covalence_perms::PermsError;
use covalence_store::StoreError;
use covalence_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A batch's signature did not verify.
    #[error("invalid signature in {id} session {session}")]
    InvalidSignature { id: CoValueId, session: SessionId },

    /// The acting agent's role does not allow the operation.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// No peer or store could provide the CoValue.
    #[error("covalue unavailable: {0}")]
    Unavailable(CoValueId),

    /// Groups needed to resolve permissions are still loading.
    #[error("waiting for dependencies: {0:?}")]
    MissingDependency(Vec<CoValueId>),

    /// The operation does not apply to this kind of CoValue.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
