//! Known state: what a node holds of one CoValue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{CoValueId, SessionId};

/// Per-session transaction counts for one CoValue.
///
/// `sessions[s]` is the number of transactions known for `s`, which is also
/// the index of the first transaction that would be new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoValueId,
    pub header: bool,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, u32>,
}

impl KnownState {
    /// Nothing known about `id`.
    pub fn empty(id: CoValueId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// True when `other` holds everything `self` does.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        (!self.header || other.header)
            && self
                .sessions
                .iter()
                .all(|(session, &count)| other.count(session) >= count)
    }

    /// Merge in another view, keeping the larger count per session.
    pub fn combine(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let entry = self.sessions.entry(*session).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Sessions where `self` is ahead of `peer`, with the peer's count.
    pub fn ahead_of(&self, peer: &KnownState) -> BTreeMap<SessionId, u32> {
        self.sessions
            .iter()
            .filter(|(session, count)| peer.count(session) < **count)
            .map(|(session, _)| (*session, peer.count(session)))
            .collect()
    }

    /// Total transactions across sessions.
    pub fn total(&self) -> u64 {
        self.sessions.values().map(|&c| c as u64).sum()
    }
}
