//! Schema migrations for the SQL and key-value backends.
//!
//! Migrations are forward-only and keyed by an integer version recorded in
//! `_migration_version`. Each version is applied in its own transaction
//! together with its version row, so a crash leaves the schema at a whole
//! version.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current SQL schema version.
pub const CURRENT_VERSION: u32 = 3;

/// Current key-value layout version.
pub const KV_CURRENT_VERSION: u32 = 1;

/// Key of the layout version in the sled `meta` tree.
pub const KV_VERSION_KEY: &[u8] = b"_migration_version";

const MIGRATIONS: [&str; CURRENT_VERSION as usize] = [
    // v1: values, sessions, transaction rows
    r#"
    CREATE TABLE coValues (
        rowID INTEGER PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,          -- co_<hex>
        header TEXT NOT NULL              -- header JSON
    );

    CREATE TABLE sessions (
        rowID INTEGER PRIMARY KEY,
        coValue INTEGER NOT NULL REFERENCES coValues(rowID),
        sessionID TEXT NOT NULL,
        lastIdx INTEGER NOT NULL,         -- number of stored transactions
        lastSignature TEXT NOT NULL,      -- hex
        UNIQUE (sessionID, coValue)
    );

    CREATE TABLE transactions (
        ses INTEGER NOT NULL REFERENCES sessions(rowID),
        idx INTEGER NOT NULL,
        tx TEXT NOT NULL,                 -- transaction JSON
        PRIMARY KEY (ses, idx)
    ) WITHOUT ROWID;
    "#,
    // v2: signature checkpoints
    r#"
    ALTER TABLE sessions ADD COLUMN bytesSinceLastSignature INTEGER NOT NULL DEFAULT 0;

    CREATE TABLE signatureAfter (
        ses INTEGER NOT NULL REFERENCES sessions(rowID),
        idx INTEGER NOT NULL,
        signature TEXT NOT NULL,
        PRIMARY KEY (ses, idx)
    ) WITHOUT ROWID;
    "#,
    // v3
    r#"
    CREATE INDEX sessionsByCoValue ON sessions (coValue);
    "#,
];

/// Schema version recorded in the database (0 when fresh).
pub fn schema_version(conn: &Connection) -> Result<u32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migration_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migration_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Initialize or migrate the database schema.
///
/// Idempotent: calling it on an up-to-date database does nothing.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{} is newer than supported v{}",
            current, CURRENT_VERSION
        )));
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(MIGRATIONS[(version - 1) as usize])
            .map_err(|e| StoreError::Migration(format!("v{}: {}", version, e)))?;
        tx.execute(
            "INSERT INTO _migration_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, now_millis()],
        )?;
        tx.commit()?;
        tracing::info!(version, "applied storage migration");
    }

    Ok(())
}

/// Migrate a sled database to the current key-value layout.
///
/// v1 introduced the `coValues`, `sessions`, `transactions` and
/// `signatureAfter` trees; opening them is all the migration does.
pub fn migrate_kv(db: &sled::Db) -> Result<()> {
    let meta = db.open_tree("meta")?;
    let current = match meta.get(KV_VERSION_KEY)? {
        Some(bytes) => {
            let bytes: [u8; 4] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::InvalidData("malformed layout version".into()))?;
            u32::from_be_bytes(bytes)
        }
        None => 0,
    };
    if current > KV_CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "key-value layout v{} is newer than supported v{}",
            current, KV_CURRENT_VERSION
        )));
    }
    if current < 1 {
        for tree in ["coValues", "sessions", "transactions", "signatureAfter"] {
            db.open_tree(tree)?;
        }
        meta.insert(KV_VERSION_KEY, &KV_CURRENT_VERSION.to_be_bytes()[..])?;
        tracing::info!(version = KV_CURRENT_VERSION, "applied key-value migration");
    }
    Ok(())
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
