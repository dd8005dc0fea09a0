//! Key-value implementation of the Store trait on sled.
//!
//! Layout (one tree per table):
//!
//! | tree | key | value |
//! |---|---|---|
//! | `coValues` | `co_<hex>` | header JSON |
//! | `sessions` | `co_<hex>/<session>` | CBOR session record |
//! | `transactions` | `co_<hex>/<session>/` ‖ idx (u32 BE) | transaction JSON |
//! | `signatureAfter` | `co_<hex>/<session>/` ‖ idx (u32 BE) | 64-byte signature |
//! | `meta` | `_migration_version` | u32 BE |
//!
//! Big-endian indices keep each session's rows in index order.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::{Db, Transactional, Tree};

use covalence_core::{
    CoValueHeader, CoValueId, Ed25519Signature, KnownState, NewContentPiece, SessionId,
    Transaction,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::plan::{assemble_pieces, chunk_session, plan_session, SessionPlan, StoredSession};
use crate::traits::{Store, StoreOutcome};

/// sled-backed store.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    covalues: Tree,
    sessions: Tree,
    transactions: Tree,
    signatures: Tree,
}

fn session_key(id: &CoValueId, session: &SessionId) -> Vec<u8> {
    format!("{}/{}", id, session).into_bytes()
}

fn row_key(id: &CoValueId, session: &SessionId, idx: u32) -> Vec<u8> {
    let mut key = format!("{}/{}/", id, session).into_bytes();
    key.extend_from_slice(&idx.to_be_bytes());
    key
}

fn encode_session(session: &StoredSession) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(session, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_session(bytes: &[u8]) -> Result<StoredSession> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_signature(bytes: &[u8]) -> Result<Ed25519Signature> {
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData("signature is not 64 bytes".into()))?;
    Ok(Ed25519Signature(bytes))
}

fn abort(e: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e)
}

/// What a write transaction did, before the known state is read back.
enum WriteResult {
    Stored,
    Correction,
    MissingHeader,
}

impl SledStore {
    /// Open (or create) a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// A throwaway database removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        migration::migrate_kv(&db)?;
        Ok(Self {
            covalues: db.open_tree("coValues")?,
            sessions: db.open_tree("sessions")?,
            transactions: db.open_tree("transactions")?,
            signatures: db.open_tree("signatureAfter")?,
            db,
        })
    }

    fn read_header(&self, id: &CoValueId) -> Result<Option<CoValueHeader>> {
        self.covalues
            .get(id.to_string().as_bytes())?
            .map(|bytes| -> Result<CoValueHeader> { Ok(serde_json::from_slice(&bytes)?) })
            .transpose()
    }

    fn read_sessions(&self, id: &CoValueId) -> Result<Vec<(SessionId, StoredSession)>> {
        let prefix = format!("{}/", id);
        self.sessions
            .scan_prefix(prefix.as_bytes())
            .map(|item| -> Result<(SessionId, StoredSession)> {
                let (key, value) = item?;
                let session = std::str::from_utf8(&key[prefix.len()..])
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?
                    .parse::<SessionId>()
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                Ok((session, decode_session(&value)?))
            })
            .collect()
    }

    fn read_known(&self, id: &CoValueId) -> Result<KnownState> {
        let mut known = KnownState::empty(*id);
        if !self.covalues.contains_key(id.to_string().as_bytes())? {
            return Ok(known);
        }
        known.header = true;
        for (session, stored) in self.read_sessions(id)? {
            known.sessions.insert(session, stored.last_idx);
        }
        Ok(known)
    }

    fn write(&self, piece: &NewContentPiece) -> Result<WriteResult> {
        let trees = (
            &self.covalues,
            &self.sessions,
            &self.transactions,
            &self.signatures,
        );
        let result = trees.transaction(
            |(covalues, sessions, transactions, signatures): &(
                TransactionalTree,
                TransactionalTree,
                TransactionalTree,
                TransactionalTree,
            )|
             -> ConflictableTransactionResult<WriteResult, StoreError> {
                let id_key = piece.id.to_string().into_bytes();
                if covalues.get(&id_key)?.is_none() {
                    match &piece.header {
                        Some(header) => {
                            let json = serde_json::to_vec(header)
                                .map_err(|e| abort(StoreError::from(e)))?;
                            covalues.insert(id_key, json)?;
                        }
                        None => return Ok(WriteResult::MissingHeader),
                    }
                }

                let mut corrected = false;
                for (session, content) in &piece.new {
                    let key = session_key(&piece.id, session);
                    let stored = match sessions.get(&key)? {
                        Some(bytes) => Some(decode_session(&bytes).map_err(abort)?),
                        None => None,
                    };
                    match plan_session(stored.as_ref(), content) {
                        SessionPlan::AlreadyKnown => {}
                        SessionPlan::Gap { stored } => {
                            tracing::debug!(
                                covalue = %piece.id,
                                session = %session,
                                stored,
                                after = content.after,
                                "content starts past stored end"
                            );
                            corrected = true;
                        }
                        SessionPlan::Append(append) => {
                            for (offset, tx) in append.transactions.iter().enumerate() {
                                let json = serde_json::to_vec(tx)
                                    .map_err(|e| abort(StoreError::from(e)))?;
                                transactions.insert(
                                    row_key(&piece.id, session, append.from + offset as u32),
                                    json,
                                )?;
                            }
                            if let Some(idx) = append.checkpoint {
                                signatures.insert(
                                    row_key(&piece.id, session, idx),
                                    append.session.last_signature.as_bytes().to_vec(),
                                )?;
                            }
                            sessions.insert(key, encode_session(&append.session).map_err(abort)?)?;
                        }
                    }
                }
                Ok(if corrected {
                    WriteResult::Correction
                } else {
                    WriteResult::Stored
                })
            },
        )?;
        Ok(result)
    }

    fn read_content(&self, id: &CoValueId, since: &KnownState) -> Result<Vec<NewContentPiece>> {
        let Some(header) = self.read_header(id)? else {
            return Ok(Vec::new());
        };

        let mut sessions = Vec::new();
        for (session, stored) in self.read_sessions(id)? {
            let from = since.count(&session);
            if from >= stored.last_idx {
                continue;
            }
            let start = row_key(id, &session, from);
            let end = row_key(id, &session, stored.last_idx);

            let checkpoints = self
                .signatures
                .range(start.clone()..end.clone())
                .map(|item| -> Result<(u32, Ed25519Signature)> {
                    let (key, value) = item?;
                    let idx_bytes: [u8; 4] = key[key.len() - 4..]
                        .try_into()
                        .map_err(|_| StoreError::InvalidData("malformed row key".into()))?;
                    Ok((u32::from_be_bytes(idx_bytes), decode_signature(&value)?))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;

            let transactions = self
                .transactions
                .range(start..end)
                .map(|item| -> Result<Transaction> {
                    let (_, value) = item?;
                    Ok(serde_json::from_slice::<Transaction>(&value)?)
                })
                .collect::<Result<Vec<_>>>()?;

            let chunks = chunk_session(&session, from, &stored, &checkpoints, transactions)?;
            sessions.push((session, chunks));
        }

        Ok(assemble_pieces(*id, (!since.header).then_some(header), sessions))
    }
}

#[async_trait]
impl Store for SledStore {
    async fn get_header(&self, id: &CoValueId) -> Result<Option<CoValueHeader>> {
        self.read_header(id)
    }

    async fn known_state(&self, id: &CoValueId) -> Result<KnownState> {
        self.read_known(id)
    }

    async fn load_content(
        &self,
        id: &CoValueId,
        since: &KnownState,
    ) -> Result<Vec<NewContentPiece>> {
        self.read_content(id, since)
    }

    async fn store_content(&self, piece: &NewContentPiece) -> Result<StoreOutcome> {
        let result = self.write(piece)?;
        self.db.flush_async().await?;
        Ok(match result {
            WriteResult::MissingHeader => StoreOutcome::MissingHeader,
            WriteResult::Stored => StoreOutcome::Stored {
                known: self.read_known(&piece.id)?,
            },
            WriteResult::Correction => StoreOutcome::Correction {
                known: self.read_known(&piece.id)?,
            },
        })
    }

    async fn list_covalues(&self) -> Result<Vec<CoValueId>> {
        self.covalues
            .iter()
            .keys()
            .map(|key| -> Result<CoValueId> {
                let key = key?;
                std::str::from_utf8(&key)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?
                    .parse()
                    .map_err(|e: covalence_core::CoreError| StoreError::InvalidData(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::tests::{verify_pieces, Fixture};

    #[tokio::test]
    async fn test_store_and_load() {
        let store = SledStore::temporary().unwrap();
        let fixture = Fixture::new(&[&[1, 2], &[3]]);
        let id = fixture.id();

        assert_eq!(
            store.store_content(&fixture.piece(0, false)).await.unwrap(),
            StoreOutcome::MissingHeader
        );
        assert!(store.list_covalues().await.unwrap().is_empty());

        store.store_content(&fixture.piece(0, true)).await.unwrap();
        let outcome = store.store_content(&fixture.piece(1, false)).await.unwrap();
        assert_eq!(outcome.known().unwrap().count(&fixture.session), 3);

        let pieces = store.load_content(&id, &KnownState::empty(id)).await.unwrap();
        assert_eq!(pieces[0].header.as_ref(), Some(&fixture.header));
        assert_eq!(verify_pieces(&fixture, &pieces), 3);
        assert_eq!(store.list_covalues().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_gap_and_checkpoints() {
        let store = SledStore::temporary().unwrap();
        let fixture = Fixture::new(&[&[70 * 1024, 40 * 1024], &[8]]);
        let id = fixture.id();

        let mut early = fixture.piece(1, true);
        early.new.get_mut(&fixture.session).unwrap().after = 2;
        assert!(matches!(
            store.store_content(&early).await.unwrap(),
            StoreOutcome::Correction { .. }
        ));

        store.store_content(&fixture.piece(0, true)).await.unwrap();
        store.store_content(&fixture.piece(1, false)).await.unwrap();
        let pieces = store.load_content(&id, &KnownState::empty(id)).await.unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(verify_pieces(&fixture, &pieces), 3);
    }

    #[tokio::test]
    async fn test_reopen_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new(&[&[3, 3]]);
        let id = fixture.id();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.store_content(&fixture.piece(0, true)).await.unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.known_state(&id).await.unwrap().count(&fixture.session), 2);
    }
}
