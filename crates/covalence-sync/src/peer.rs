//! Peer identity, configuration and per-CoValue sync state.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use covalence_core::{CoValueId, KnownState, NewContentPiece};

/// Identifier of a sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(format!("peer_{}", hex::encode(rand::random::<[u8; 8]>())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What a peer is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Receives only what it subscribed to.
    Client,
    /// Receives all local content and is asked when loading.
    Server,
    /// Durable storage, otherwise treated like a server.
    Storage,
}

impl PeerRole {
    /// Whether content is pushed to this peer without a subscription.
    pub fn receives_all(self) -> bool {
        matches!(self, PeerRole::Server | PeerRole::Storage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: PeerId,
    pub role: PeerRole,
    /// Higher-priority peers are asked first when loading.
    pub priority: i32,
}

impl PeerConfig {
    pub fn new(id: impl Into<PeerId>, role: PeerRole) -> Self {
        Self {
            id: id.into(),
            role,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Sync progress of one CoValue with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSyncState {
    #[default]
    Idle,
    /// A load was exchanged; the peer is interested in the value.
    Subscribed,
    /// Content is flowing.
    Syncing,
    /// The peer finished its round.
    Synced,
}

/// What we believe a peer holds, and how far each CoValue has synced.
///
/// `known` runs ahead of the peer as soon as content is queued for it.
/// `confirmed` only moves when the peer itself reports or sends state.
#[derive(Debug, Default)]
pub struct PeerState {
    known: HashMap<CoValueId, KnownState>,
    confirmed: HashMap<CoValueId, KnownState>,
    sync: HashMap<CoValueId, PeerSyncState>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(&self, id: &CoValueId) -> Option<&KnownState> {
        self.known.get(id)
    }

    pub fn known_or_empty(&self, id: &CoValueId) -> KnownState {
        self.known
            .get(id)
            .cloned()
            .unwrap_or_else(|| KnownState::empty(*id))
    }

    /// What the peer itself has reported holding.
    pub fn confirmed(&self, id: &CoValueId) -> Option<&KnownState> {
        self.confirmed.get(id)
    }

    /// Merge a state the peer reported (never lowers what we believe).
    pub fn record_known(&mut self, state: &KnownState) {
        for map in [&mut self.known, &mut self.confirmed] {
            map.entry(state.id)
                .or_insert_with(|| KnownState::empty(state.id))
                .combine(state);
        }
    }

    /// Replace our belief (after a correction).
    pub fn set_known(&mut self, state: KnownState) {
        self.confirmed.insert(state.id, state.clone());
        self.known.insert(state.id, state);
    }

    /// Optimistically account for content we sent.
    pub fn record_sent(&mut self, piece: &NewContentPiece) {
        let base = self.known_or_empty(&piece.id);
        self.known.insert(piece.id, piece.known_after(&base));
    }

    pub fn sync_state(&self, id: &CoValueId) -> PeerSyncState {
        self.sync.get(id).copied().unwrap_or_default()
    }

    /// Whether the peer is part of the conversation about `id`.
    pub fn is_subscribed(&self, id: &CoValueId) -> bool {
        self.sync_state(id) != PeerSyncState::Idle
    }

    /// `idle -> subscribed`; later states are kept.
    pub fn subscribe(&mut self, id: &CoValueId) {
        let state = self.sync.entry(*id).or_default();
        if *state == PeerSyncState::Idle {
            *state = PeerSyncState::Subscribed;
        }
    }

    /// Content moved in either direction.
    pub fn syncing(&mut self, id: &CoValueId) {
        self.sync.insert(*id, PeerSyncState::Syncing);
    }

    /// The peer reported the end of its round.
    pub fn synced(&mut self, id: &CoValueId) {
        self.sync.insert(*id, PeerSyncState::Synced);
    }

    /// Forget a CoValue (after it left memory).
    pub fn forget(&mut self, id: &CoValueId) {
        self.known.remove(id);
        self.confirmed.remove(id);
        self.sync.remove(id);
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &CoValueId> {
        self.sync
            .iter()
            .filter(|(_, state)| **state != PeerSyncState::Idle)
            .map(|(id, _)| id)
    }
}
