//! Storage as a peer.
//!
//! The storage peer speaks the same protocol as a remote node: `load` is
//! answered from the store and `content` is persisted through a
//! [`StoreQueue`]. Every write is answered with what the store actually
//! holds: a plain `known` once it landed or failed, a `known` correction when
//! the sender is ahead of the stored log. A read that fails is answered with
//! nothing, so a waiting load times out instead of seeing the value as
//! missing.

use std::sync::Arc;

use tokio::sync::mpsc;

use covalence_core::{KnownState, NewContentPiece};
use covalence_store::{Store, StoreQueue, WriteReport};

use crate::messages::SyncMessage;
use crate::transport::memory::{self, MemoryTransport};
use crate::transport::Transport;

/// Start serving `store` and return the node's end of the connection.
pub fn spawn_storage_peer(store: Arc<dyn Store>, capacity: usize) -> MemoryTransport {
    let (node_side, storage_side) = memory::pair(capacity);
    tokio::spawn(run(store, storage_side));
    node_side
}

async fn run(store: Arc<dyn Store>, transport: MemoryTransport) {
    let transport = Arc::new(transport);
    let (out, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();

    let writer = {
        let transport = transport.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if transport.send(message).await.is_err() {
                    break;
                }
            }
        })
    };

    let reports = out.clone();
    let queue = StoreQueue::spawn(
        store.clone(),
        Arc::new(move |report: WriteReport| {
            let message = match report {
                WriteReport::Stored(known) => SyncMessage::known(known),
                WriteReport::Correction(known) => {
                    tracing::debug!(covalue = %known.id, "storage requests resend");
                    SyncMessage::correction(known)
                }
                // Not a correction: an immediate resend would fail the same way.
                WriteReport::Failed { known, error } => {
                    tracing::warn!(covalue = %known.id, %error, "content not persisted");
                    SyncMessage::known(known)
                }
            };
            let _ = reports.send(message);
        }),
    );

    let peer = StoragePeer { store, queue, out };
    loop {
        match transport.recv().await {
            Ok(Some(message)) => peer.handle(message).await,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "storage peer connection failed");
                break;
            }
        }
    }
    writer.abort();
    tracing::debug!("storage peer stopped");
}

struct StoragePeer {
    store: Arc<dyn Store>,
    queue: StoreQueue,
    out: mpsc::UnboundedSender<SyncMessage>,
}

impl StoragePeer {
    async fn handle(&self, message: SyncMessage) {
        match message {
            SyncMessage::Load(known) => self.answer(&known, true).await,
            SyncMessage::Known {
                id,
                header,
                sessions,
                is_correction: true,
            } => {
                let known = KnownState {
                    id,
                    header,
                    sessions,
                };
                self.answer(&known, false).await;
            }
            SyncMessage::Content(piece) => self.persist(piece),
            SyncMessage::Ping => self.send(SyncMessage::Pong),
            SyncMessage::Known { .. } | SyncMessage::Done { .. } | SyncMessage::Pong => {}
        }
    }

    /// Reply with our known state (optionally) and everything beyond `theirs`.
    ///
    /// The round is only closed with `done` when every read succeeded.
    async fn answer(&self, theirs: &KnownState, with_known: bool) {
        let id = theirs.id;
        let ours = match self.store.known_state(&id).await {
            Ok(ours) => ours,
            Err(e) => {
                tracing::warn!(covalue = %id, error = %e, "cannot read stored state");
                return;
            }
        };
        if with_known {
            self.send(SyncMessage::known(ours.clone()));
        }
        if ours.header {
            match self.store.load_content(&id, theirs).await {
                Ok(pieces) => {
                    for piece in pieces {
                        self.send(SyncMessage::Content(piece));
                    }
                }
                Err(e) => {
                    tracing::warn!(covalue = %id, error = %e, "cannot load stored content");
                    return;
                }
            }
        }
        self.send(SyncMessage::Done { id });
    }

    fn persist(&self, piece: NewContentPiece) {
        let id = piece.id;
        if let Err(e) = self.queue.enqueue(piece) {
            tracing::warn!(covalue = %id, error = %e, "dropping content, store queue closed");
        }
    }

    fn send(&self, message: SyncMessage) {
        let _ = self.out.send(message);
    }
}
