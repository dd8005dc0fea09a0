//! SQLite implementation of the Store trait.
//!
//! Rows follow the `coValues` / `sessions` / `transactions` / `signatureAfter`
//! schema. Writes of one content piece happen inside a single SQL transaction.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use covalence_core::{
    CoValueHeader, CoValueId, Ed25519Signature, KnownState, NewContentPiece, SessionId,
    Transaction,
};

use crate::driver::SqliteDriver;
use crate::error::{Result, StoreError};
use crate::plan::{assemble_pieces, chunk_session, plan_session, SessionPlan, StoredSession};
use crate::traits::{Store, StoreOutcome};

/// SQLite-based store.
#[derive(Clone)]
pub struct SqliteStore {
    driver: SqliteDriver,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            driver: SqliteDriver::open(path)?,
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            driver: SqliteDriver::open_memory()?,
        })
    }

    pub fn driver(&self) -> &SqliteDriver {
        &self.driver
    }
}

fn parse_signature(hex: &str) -> Result<Ed25519Signature> {
    Ed25519Signature::from_hex(hex).map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn parse_header(json: &str) -> Result<CoValueHeader> {
    Ok(serde_json::from_str(json)?)
}

fn covalue_row(conn: &Connection, id: &CoValueId) -> Result<Option<(i64, CoValueHeader)>> {
    let row = conn
        .query_row(
            "SELECT rowID, header FROM coValues WHERE id = ?1",
            [id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    row.map(|(rowid, header)| -> Result<(i64, CoValueHeader)> {
        Ok((rowid, parse_header(&header)?))
    })
        .transpose()
}

fn session_row(
    conn: &Connection,
    covalue: i64,
    session: &SessionId,
) -> Result<Option<(i64, StoredSession)>> {
    let row = conn
        .query_row(
            "SELECT rowID, lastIdx, lastSignature, bytesSinceLastSignature
             FROM sessions WHERE coValue = ?1 AND sessionID = ?2",
            params![covalue, session.to_string()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(rowid, last_idx, signature, bytes)| -> Result<(i64, StoredSession)> {
        Ok((
            rowid,
            StoredSession {
                last_idx,
                last_signature: parse_signature(&signature)?,
                bytes_since_last_signature: bytes as u64,
            },
        ))
    })
    .transpose()
}

fn session_rows(conn: &Connection, covalue: i64) -> Result<Vec<(i64, SessionId, StoredSession)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT rowID, sessionID, lastIdx, lastSignature, bytesSinceLastSignature
         FROM sessions WHERE coValue = ?1 ORDER BY sessionID",
    )?;
    let rows = stmt
        .query_map([covalue], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(rowid, session, last_idx, signature, bytes)| -> Result<(i64, SessionId, StoredSession)> {
            let session: SessionId = session
                .parse()
                .map_err(|e: covalence_core::CoreError| StoreError::InvalidData(e.to_string()))?;
            Ok((
                rowid,
                session,
                StoredSession {
                    last_idx,
                    last_signature: parse_signature(&signature)?,
                    bytes_since_last_signature: bytes as u64,
                },
            ))
        })
        .collect()
}

fn known_for_row(conn: &Connection, id: CoValueId, covalue: i64) -> Result<KnownState> {
    let mut known = KnownState::empty(id);
    known.header = true;
    for (_, session, stored) in session_rows(conn, covalue)? {
        known.sessions.insert(session, stored.last_idx);
    }
    Ok(known)
}

fn read_known(conn: &Connection, id: &CoValueId) -> Result<KnownState> {
    match covalue_row(conn, id)? {
        Some((rowid, _)) => known_for_row(conn, *id, rowid),
        None => Ok(KnownState::empty(*id)),
    }
}

fn read_content(
    conn: &Connection,
    id: &CoValueId,
    since: &KnownState,
) -> Result<Vec<NewContentPiece>> {
    let Some((covalue, header)) = covalue_row(conn, id)? else {
        return Ok(Vec::new());
    };

    let mut sessions = Vec::new();
    for (ses, session, stored) in session_rows(conn, covalue)? {
        let from = since.count(&session);
        if from >= stored.last_idx {
            continue;
        }

        let mut stmt = conn.prepare_cached(
            "SELECT idx, signature FROM signatureAfter WHERE ses = ?1 AND idx >= ?2 ORDER BY idx",
        )?;
        let checkpoints = stmt
            .query_map(params![ses, from], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(idx, sig)| -> Result<(u32, Ed25519Signature)> {
                Ok((idx, parse_signature(&sig)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let mut stmt = conn.prepare_cached(
            "SELECT tx FROM transactions WHERE ses = ?1 AND idx >= ?2 AND idx < ?3 ORDER BY idx",
        )?;
        let transactions = stmt
            .query_map(params![ses, from, stored.last_idx], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .iter()
            .map(|json| -> Result<Transaction> { Ok(serde_json::from_str(json)?) })
            .collect::<Result<Vec<_>>>()?;

        let chunks = chunk_session(&session, from, &stored, &checkpoints, transactions)?;
        sessions.push((session, chunks));
    }

    Ok(assemble_pieces(*id, (!since.header).then_some(header), sessions))
}

/// Write one piece using `conn`, which the caller wraps in a transaction.
pub(crate) fn write_piece(conn: &Connection, piece: &NewContentPiece) -> Result<StoreOutcome> {
    let id_text = piece.id.to_string();
    let covalue = match covalue_row(conn, &piece.id)? {
        Some((rowid, _)) => rowid,
        None => match &piece.header {
            Some(header) => {
                conn.execute(
                    "INSERT INTO coValues (id, header) VALUES (?1, ?2)",
                    params![id_text, serde_json::to_string(header)?],
                )?;
                conn.last_insert_rowid()
            }
            None => return Ok(StoreOutcome::MissingHeader),
        },
    };

    let mut corrected = false;
    for (session, content) in &piece.new {
        let stored = session_row(conn, covalue, session)?;
        match plan_session(stored.as_ref().map(|(_, s)| s), content) {
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
                let signature = append.session.last_signature.to_hex();
                let ses = match stored {
                    Some((ses, _)) => {
                        conn.execute(
                            "UPDATE sessions
                             SET lastIdx = ?1, lastSignature = ?2, bytesSinceLastSignature = ?3
                             WHERE rowID = ?4",
                            params![
                                append.session.last_idx,
                                signature,
                                append.session.bytes_since_last_signature as i64,
                                ses
                            ],
                        )?;
                        ses
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO sessions
                             (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![
                                covalue,
                                session.to_string(),
                                append.session.last_idx,
                                signature,
                                append.session.bytes_since_last_signature as i64
                            ],
                        )?;
                        conn.last_insert_rowid()
                    }
                };

                let mut insert = conn.prepare_cached(
                    "INSERT OR REPLACE INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)",
                )?;
                for (offset, tx) in append.transactions.iter().enumerate() {
                    insert.execute(params![
                        ses,
                        append.from + offset as u32,
                        serde_json::to_string(tx)?
                    ])?;
                }

                if let Some(idx) = append.checkpoint {
                    conn.execute(
                        "INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)",
                        params![ses, idx, signature],
                    )?;
                }
            }
        }
    }

    let known = known_for_row(conn, piece.id, covalue)?;
    Ok(if corrected {
        StoreOutcome::Correction { known }
    } else {
        StoreOutcome::Stored { known }
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_header(&self, id: &CoValueId) -> Result<Option<CoValueHeader>> {
        let header = self
            .driver
            .get(
                "SELECT header FROM coValues WHERE id = ?1",
                vec![Value::Text(id.to_string())],
                |row| row.get::<_, String>(0),
            )
            .await?;
        header.as_deref().map(parse_header).transpose()
    }

    async fn known_state(&self, id: &CoValueId) -> Result<KnownState> {
        let id = *id;
        self.driver.transaction(move |tx| read_known(tx, &id)).await
    }

    async fn load_content(
        &self,
        id: &CoValueId,
        since: &KnownState,
    ) -> Result<Vec<NewContentPiece>> {
        let id = *id;
        let since = since.clone();
        self.driver
            .transaction(move |tx| read_content(tx, &id, &since))
            .await
    }

    async fn store_content(&self, piece: &NewContentPiece) -> Result<StoreOutcome> {
        let piece = piece.clone();
        self.driver
            .transaction(move |tx| write_piece(tx, &piece))
            .await
    }

    async fn list_covalues(&self) -> Result<Vec<CoValueId>> {
        let ids = self
            .driver
            .query("SELECT id FROM coValues ORDER BY rowID", vec![], |row| {
                row.get::<_, String>(0)
            })
            .await?;
        ids.iter()
            .map(|id| {
                id.parse()
                    .map_err(|e: covalence_core::CoreError| StoreError::InvalidData(e.to_string()))
            })
            .collect()
    }
}
