//! Write planning and read assembly shared by the SQL and key-value backends.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use covalence_core::{
    CoValueHeader, CoValueId, Ed25519Signature, NewContentPiece, SessionId, SessionNewContent,
    Transaction, MAX_BYTES_BETWEEN_SIGNATURES,
};

use crate::error::{Result, StoreError};

/// Stored bookkeeping of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredSession {
    /// Number of stored transactions.
    pub last_idx: u32,
    pub last_signature: Ed25519Signature,
    pub bytes_since_last_signature: u64,
}

/// Rows to add for one session.
#[derive(Debug)]
pub(crate) struct Append<'a> {
    pub from: u32,
    pub transactions: &'a [Transaction],
    pub session: StoredSession,
    /// Index to record in `signatureAfter`, when the byte budget ran out.
    pub checkpoint: Option<u32>,
}

#[derive(Debug)]
pub(crate) enum SessionPlan<'a> {
    AlreadyKnown,
    /// The range starts past the stored end.
    Gap { stored: u32 },
    Append(Append<'a>),
}

pub(crate) fn plan_session<'a>(
    stored: Option<&StoredSession>,
    content: &'a SessionNewContent,
) -> SessionPlan<'a> {
    let known = stored.map_or(0, |s| s.last_idx);
    if content.after > known {
        return SessionPlan::Gap { stored: known };
    }
    let end = content.end();
    if end <= known {
        return SessionPlan::AlreadyKnown;
    }

    let fresh = &content.new_transactions[(known - content.after) as usize..];
    let added: u64 = fresh.iter().map(|tx| tx.payload_len() as u64).sum();
    let mut bytes_since = stored.map_or(0, |s| s.bytes_since_last_signature) + added;
    let checkpoint = if bytes_since > MAX_BYTES_BETWEEN_SIGNATURES as u64 {
        bytes_since = 0;
        Some(end - 1)
    } else {
        None
    };

    SessionPlan::Append(Append {
        from: known,
        transactions: fresh,
        session: StoredSession {
            last_idx: end,
            last_signature: content.last_signature,
            bytes_since_last_signature: bytes_since,
        },
        checkpoint,
    })
}

/// Split `from..count` into ranges ending at checkpoints or at the end.
pub(crate) fn signed_ranges(
    from: u32,
    count: u32,
    checkpoints: &BTreeMap<u32, Ed25519Signature>,
    last: Ed25519Signature,
) -> Vec<(Range<u32>, Ed25519Signature)> {
    if from >= count {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut start = from;
    for (&idx, sig) in checkpoints.range(from..count - 1) {
        ranges.push((start..idx + 1, *sig));
        start = idx + 1;
    }
    ranges.push((start..count, last));
    ranges
}

/// Cut the stored transactions `from..` of one session into signed chunks.
///
/// `transactions` must hold exactly the rows `from..stored.last_idx`.
pub(crate) fn chunk_session(
    session: &SessionId,
    from: u32,
    stored: &StoredSession,
    checkpoints: &BTreeMap<u32, Ed25519Signature>,
    transactions: Vec<Transaction>,
) -> Result<Vec<SessionNewContent>> {
    let expected = stored.last_idx.saturating_sub(from) as usize;
    if transactions.len() != expected {
        return Err(StoreError::InvalidData(format!(
            "session {} has {} transaction rows after {}, expected {}",
            session,
            transactions.len(),
            from,
            expected
        )));
    }
    Ok(
        signed_ranges(from, stored.last_idx, checkpoints, stored.last_signature)
            .into_iter()
            .map(|(range, signature)| SessionNewContent {
                after: range.start,
                new_transactions: transactions
                    [(range.start - from) as usize..(range.end - from) as usize]
                    .to_vec(),
                last_signature: signature,
            })
            .collect(),
    )
}

/// Assemble per-session chunks into pieces: piece `n` carries the `n`-th
/// chunk of every session, and the header travels with the first piece.
pub(crate) fn assemble_pieces(
    id: CoValueId,
    header: Option<CoValueHeader>,
    sessions: Vec<(SessionId, Vec<SessionNewContent>)>,
) -> Vec<NewContentPiece> {
    let mut pieces: Vec<NewContentPiece> = Vec::new();
    for (session, chunks) in sessions {
        for (n, chunk) in chunks.into_iter().enumerate() {
            if pieces.len() <= n {
                pieces.push(NewContentPiece::new(id));
            }
            pieces[n].new.insert(session, chunk);
        }
    }
    if let Some(header) = header {
        if pieces.is_empty() {
            pieces.push(NewContentPiece::new(id));
        }
        pieces[0].header = Some(header);
    }
    pieces
}
