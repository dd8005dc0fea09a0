//! StoreQueue: serializes content writes to one store.
//!
//! Incoming content from many peers funnels through a single worker task, so
//! two batches for the same session are never interleaved. Every write is
//! reported back through the report callback with the store's actual known
//! state: an acknowledgement when it landed, a correction when the sender is
//! ahead of what is stored, or a failure when the backend returned an error.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use covalence_core::{KnownState, NewContentPiece};

use crate::error::{Result, StoreError};
use crate::traits::{Store, StoreOutcome};

/// What became of one queued write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteReport {
    /// The piece is durable; `known` is what the store now holds.
    Stored(KnownState),
    /// The sender must resume from `known`.
    Correction(KnownState),
    /// The backend failed; `known` is what the store still holds.
    Failed { known: KnownState, error: String },
}

impl WriteReport {
    pub fn known(&self) -> &KnownState {
        match self {
            WriteReport::Stored(known)
            | WriteReport::Correction(known)
            | WriteReport::Failed { known, .. } => known,
        }
    }
}

/// Called once per write that can be reported.
pub type ReportCallback = Arc<dyn Fn(WriteReport) + Send + Sync>;

struct Job {
    piece: NewContentPiece,
    reply: Option<oneshot::Sender<Result<StoreOutcome>>>,
}

/// Handle to the write worker. Cloning shares the same worker.
#[derive(Clone)]
pub struct StoreQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl StoreQueue {
    /// Spawn the worker on the current runtime.
    pub fn spawn(store: Arc<dyn Store>, on_report: ReportCallback) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(store, on_report, rx));
        Self { tx }
    }

    /// Queue a write and wait for its outcome.
    pub async fn push(&self, piece: NewContentPiece) -> Result<StoreOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Job {
                piece,
                reply: Some(reply),
            })
            .map_err(|_| StoreError::QueueClosed)?;
        outcome.await.map_err(|_| StoreError::QueueClosed)?
    }

    /// Queue a write without waiting. The outcome arrives through the report
    /// callback.
    pub fn enqueue(&self, piece: NewContentPiece) -> Result<()> {
        self.tx
            .send(Job { piece, reply: None })
            .map_err(|_| StoreError::QueueClosed)
    }
}

async fn run(
    store: Arc<dyn Store>,
    on_report: ReportCallback,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = rx.recv().await {
        let id = job.piece.id;
        let result = store.store_content(&job.piece).await;

        match &result {
            Ok(StoreOutcome::Stored { known }) => on_report(WriteReport::Stored(known.clone())),
            Ok(StoreOutcome::Correction { known }) => {
                tracing::debug!(covalue = %id, "stored content needs correction");
                on_report(WriteReport::Correction(known.clone()));
            }
            Ok(StoreOutcome::MissingHeader) => {
                tracing::debug!(covalue = %id, "content for unknown value without header");
                on_report(WriteReport::Correction(KnownState::empty(id)));
            }
            Err(e) => {
                tracing::warn!(covalue = %id, error = %e, "store write failed");
                match store.known_state(&id).await {
                    Ok(known) => on_report(WriteReport::Failed {
                        known,
                        error: e.to_string(),
                    }),
                    // Nothing trustworthy to report; the writer keeps its
                    // unconfirmed view.
                    Err(read) => {
                        tracing::warn!(covalue = %id, error = %read, "cannot read stored state")
                    }
                }
            }
        }

        if let Some(reply) = job.reply {
            let _ = reply.send(result);
        }
    }
    tracing::debug!("store queue worker stopped");
}
