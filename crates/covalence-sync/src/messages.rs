//! Sync protocol message types.
//!
//! Messages are JSON objects discriminated by `action`. Every CoValue-scoped
//! message carries the CoValue `id`; ping and pong are connection keepalives
//! handled by the transports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use covalence_core::{CoValueId, KnownState, NewContentPiece, SessionId};

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    /// Announce what we know and ask for the rest.
    Load(KnownState),

    /// Reply with what we know. `is_correction` asks the sender to resend
    /// from exactly this state.
    #[serde(rename_all = "camelCase")]
    Known {
        id: CoValueId,
        header: bool,
        #[serde(default)]
        sessions: BTreeMap<SessionId, u32>,
        #[serde(default, skip_serializing_if = "is_false")]
        is_correction: bool,
    },

    /// Transaction ranges, each ending at a signed index.
    Content(NewContentPiece),

    /// End of one sync round for a CoValue.
    Done { id: CoValueId },

    Ping,
    Pong,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl SyncMessage {
    pub fn known(state: KnownState) -> Self {
        SyncMessage::Known {
            id: state.id,
            header: state.header,
            sessions: state.sessions,
            is_correction: false,
        }
    }

    pub fn correction(state: KnownState) -> Self {
        SyncMessage::Known {
            id: state.id,
            header: state.header,
            sessions: state.sessions,
            is_correction: true,
        }
    }

    /// The CoValue this message is about; `None` for keepalives.
    pub fn covalue_id(&self) -> Option<CoValueId> {
        match self {
            SyncMessage::Load(known) => Some(known.id),
            SyncMessage::Known { id, .. } | SyncMessage::Done { id } => Some(*id),
            SyncMessage::Content(piece) => Some(piece.id),
            SyncMessage::Ping | SyncMessage::Pong => None,
        }
    }

    /// The known state carried by `load` and `known`.
    pub fn known_state(&self) -> Option<KnownState> {
        match self {
            SyncMessage::Load(known) => Some(known.clone()),
            SyncMessage::Known {
                id,
                header,
                sessions,
                ..
            } => Some(KnownState {
                id: *id,
                header: *header,
                sessions: sessions.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, SyncMessage::Ping | SyncMessage::Pong)
    }

    /// Short name for logs.
    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known { .. } => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done { .. } => "done",
            SyncMessage::Ping => "ping",
            SyncMessage::Pong => "pong",
        }
    }
}
