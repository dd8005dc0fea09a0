//! Signed content pieces exchanged between peers and storage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Ed25519Signature;
use crate::header::CoValueHeader;
use crate::ids::{CoValueId, SessionId};
use crate::known::KnownState;
use crate::transaction::Transaction;

/// A contiguous, signed range of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    /// Index of the first transaction in `new_transactions`.
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    /// Signature over the session state after the last transaction here.
    pub last_signature: Ed25519Signature,
}

impl SessionNewContent {
    pub fn end(&self) -> u32 {
        self.after + self.new_transactions.len() as u32
    }
}

/// Header and/or session ranges of one CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContentPiece {
    pub id: CoValueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    #[serde(default)]
    pub new: BTreeMap<SessionId, SessionNewContent>,
}

impl NewContentPiece {
    pub fn new(id: CoValueId) -> Self {
        Self {
            id,
            header: None,
            new: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    /// Known state a receiver holds after applying this piece on top of `base`.
    pub fn known_after(&self, base: &KnownState) -> KnownState {
        let mut known = base.clone();
        known.header |= self.header.is_some();
        for (session, content) in &self.new {
            let entry = known.sessions.entry(*session).or_insert(0);
            *entry = (*entry).max(content.end());
        }
        known
    }

    /// Approximate payload size, used by queue accounting.
    pub fn payload_len(&self) -> usize {
        self.new
            .values()
            .flat_map(|c| c.new_transactions.iter())
            .map(Transaction::payload_len)
            .sum()
    }
}
