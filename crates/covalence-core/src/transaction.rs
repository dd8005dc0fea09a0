//! Transactions: the unit appended to a session.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_transaction_bytes;
use crate::error::CoreError;
use crate::ids::KeyId;
use crate::ops::{encode_changes, Op};
use crate::serde_hex;

/// A trusting (plaintext) or private (encrypted under a group key) change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    #[serde(rename_all = "camelCase")]
    Private {
        made_at: i64,
        key_used: KeyId,
        #[serde(with = "serde_hex::vec")]
        encrypted_changes: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Trusting {
        made_at: i64,
        /// JSON-encoded op list, kept verbatim so the hash covers the exact bytes.
        changes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
}

impl Transaction {
    /// Build a trusting transaction from ops.
    pub fn trusting(made_at: i64, ops: &[Op]) -> Result<Self, CoreError> {
        Ok(Transaction::Trusting {
            made_at,
            changes: encode_changes(ops)?,
            meta: None,
        })
    }

    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Private { made_at, .. } | Transaction::Trusting { made_at, .. } => {
                *made_at
            }
        }
    }

    pub fn key_used(&self) -> Option<&KeyId> {
        match self {
            Transaction::Private { key_used, .. } => Some(key_used),
            Transaction::Trusting { .. } => None,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }

    /// Payload size used for checkpoint accounting.
    pub fn payload_len(&self) -> usize {
        match self {
            Transaction::Private {
                encrypted_changes, ..
            } => encrypted_changes.len(),
            Transaction::Trusting { changes, .. } => changes.len(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_transaction_bytes(self)
    }
}
