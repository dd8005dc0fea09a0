//! Session logs: the verified, append-only transactions of one writer session.
//!
//! Each append is signed over a streaming Blake3 hash of every transaction in
//! the session so far, so a signature for index `i` commits to the whole prefix
//! and never has to be recomputed when `i + 1` is appended.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::crypto::{Blake3Hash, Ed25519Signature, Keypair};
use crate::error::ValidationError;
use crate::ids::{CoValueId, SessionId};
use crate::transaction::Transaction;

/// Payload bytes after which a signature checkpoint is recorded.
pub const MAX_BYTES_BETWEEN_SIGNATURES: usize = 100 * 1024;

/// Build the message a session signature covers.
pub fn session_signing_message(
    covalue: &CoValueId,
    session: &SessionId,
    hash: &Blake3Hash,
) -> Vec<u8> {
    let session = session.to_string();
    let mut msg = Vec::with_capacity(21 + 32 + session.len() + 32);
    msg.extend_from_slice(b"covalence-session-v0:");
    msg.extend_from_slice(covalue.as_bytes());
    msg.extend_from_slice(session.as_bytes());
    msg.extend_from_slice(hash.as_bytes());
    msg
}

/// Outcome of appending a batch to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// New transactions were appended.
    Appended { count: u32 },
    /// Every transaction in the batch was already present.
    AlreadyKnown,
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    hasher: blake3::Hasher,
    last_signature: Option<Ed25519Signature>,
    /// Signed indices kept so content can be re-shipped in verifiable pieces.
    signature_after: BTreeMap<u32, Ed25519Signature>,
    bytes_since_signature: usize,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLog {
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
            hasher: blake3::Hasher::new(),
            last_signature: None,
            signature_after: BTreeMap::new(),
            bytes_since_signature: 0,
        }
    }

    /// Number of transactions (also the next expected index).
    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn get(&self, idx: u32) -> Option<&Transaction> {
        self.transactions.get(idx as usize)
    }

    pub fn last_signature(&self) -> Option<&Ed25519Signature> {
        self.last_signature.as_ref()
    }

    pub fn signature_after(&self) -> &BTreeMap<u32, Ed25519Signature> {
        &self.signature_after
    }

    fn extended_hasher(&self, txs: &[Transaction]) -> blake3::Hasher {
        let mut hasher = self.hasher.clone();
        for tx in txs {
            let bytes = tx.canonical_bytes();
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        hasher
    }

    /// The hash a signature must cover after appending `txs`.
    pub fn expected_hash(&self, txs: &[Transaction]) -> Blake3Hash {
        self.extended_hasher(txs).finalize().into()
    }

    /// Verify and append a batch starting at index `after`.
    ///
    /// Overlapping batches are trimmed to their unknown suffix; the signature
    /// still has to match the full cumulative hash.
    pub fn try_append(
        &mut self,
        covalue: &CoValueId,
        session: &SessionId,
        after: u32,
        txs: &[Transaction],
        signature: &Ed25519Signature,
    ) -> Result<AppendResult, ValidationError> {
        if txs.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        let known = self.len();
        if after > known {
            return Err(ValidationError::Gap {
                session: session.to_string(),
                expected: known,
                got: after,
            });
        }
        let end = after + txs.len() as u32;
        if end <= known {
            return Ok(AppendResult::AlreadyKnown);
        }

        let fresh = &txs[(known - after) as usize..];
        let hasher = self.extended_hasher(fresh);
        let hash: Blake3Hash = hasher.finalize().into();
        let message = session_signing_message(covalue, session, &hash);
        session
            .agent()
            .signer
            .verify(&message, signature)
            .map_err(|_| ValidationError::SignatureMismatch {
                session: session.to_string(),
            })?;

        self.commit(hasher, fresh, *signature);
        Ok(AppendResult::Appended {
            count: fresh.len() as u32,
        })
    }

    /// Sign and append locally created transactions.
    pub fn sign_and_append(
        &mut self,
        covalue: &CoValueId,
        session: &SessionId,
        keypair: &Keypair,
        txs: &[Transaction],
    ) -> Result<Ed25519Signature, ValidationError> {
        if txs.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if keypair.public_key() != session.agent().signer {
            return Err(ValidationError::ForeignSession(session.to_string()));
        }
        let hasher = self.extended_hasher(txs);
        let hash: Blake3Hash = hasher.finalize().into();
        let signature = keypair.sign(&session_signing_message(covalue, session, &hash));
        self.commit(hasher, txs, signature);
        Ok(signature)
    }

    fn commit(&mut self, hasher: blake3::Hasher, txs: &[Transaction], signature: Ed25519Signature) {
        self.hasher = hasher;
        self.bytes_since_signature += txs.iter().map(Transaction::payload_len).sum::<usize>();
        self.transactions.extend_from_slice(txs);
        self.last_signature = Some(signature);
        if self.bytes_since_signature > MAX_BYTES_BETWEEN_SIGNATURES {
            self.signature_after.insert(self.len() - 1, signature);
            self.bytes_since_signature = 0;
        }
    }

    /// Split `from..len` into ranges that each end at a signed index.
    pub fn signed_ranges(&self, from: u32) -> Vec<(Range<u32>, Ed25519Signature)> {
        let len = self.len();
        let Some(last) = self.last_signature else {
            return Vec::new();
        };
        if from >= len {
            return Vec::new();
        }
        let mut ranges = Vec::new();
        let mut start = from;
        for (&idx, sig) in self.signature_after.range(from..len - 1) {
            ranges.push((start..idx + 1, *sig));
            start = idx + 1;
        }
        ranges.push((start..len, last));
        ranges
    }
}
