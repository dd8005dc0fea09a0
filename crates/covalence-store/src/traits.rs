//! Store trait: the abstract interface for CoValue persistence.
//!
//! Backends persist headers, per-session transaction rows, the last signature
//! of every session and periodic `signatureAfter` checkpoints. Implementations
//! include SQLite ([`crate::SqliteStore`]) and sled ([`crate::SledStore`]).

use async_trait::async_trait;
use covalence_core::{CoValueHeader, CoValueId, KnownState, NewContentPiece};

use crate::error::Result;

/// Result of persisting one content piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Every session range was stored or was already present.
    Stored { known: KnownState },
    /// At least one session range started beyond what is stored. The other
    /// ranges were written; `known` is the state the sender should resume from.
    Correction { known: KnownState },
    /// The CoValue is not stored and the piece carries no header. Nothing was written.
    MissingHeader,
}

impl StoreOutcome {
    pub fn known(&self) -> Option<&KnownState> {
        match self {
            StoreOutcome::Stored { known } | StoreOutcome::Correction { known } => Some(known),
            StoreOutcome::MissingHeader => None,
        }
    }
}

/// Async interface for CoValue persistence.
///
/// Every multi-row write (session row, transaction rows, checkpoint) is
/// committed atomically. Transaction rows are keyed by `(session, index)`, so
/// retrying a failed write is idempotent.
#[async_trait]
pub trait Store: Send + Sync {
    /// Header of a stored CoValue.
    async fn get_header(&self, id: &CoValueId) -> Result<Option<CoValueHeader>>;

    /// What the store holds of `id` (empty when unknown).
    async fn known_state(&self, id: &CoValueId) -> Result<KnownState>;

    /// Everything stored beyond `since`, split into pieces that each end at a
    /// signed index. The header is included when `since` lacks it.
    async fn load_content(&self, id: &CoValueId, since: &KnownState)
        -> Result<Vec<NewContentPiece>>;

    /// Persist a content piece.
    ///
    /// Signatures are not re-verified here; callers store content they have
    /// already validated.
    async fn store_content(&self, piece: &NewContentPiece) -> Result<StoreOutcome>;

    /// IDs of every stored CoValue.
    async fn list_covalues(&self) -> Result<Vec<CoValueId>>;
}
