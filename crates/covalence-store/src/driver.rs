//! Async SQL driver over rusqlite.
//!
//! SQLite is synchronous; every call locks the shared connection inside
//! `tokio::task::spawn_blocking` so the runtime never blocks on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{Result, StoreError};
use crate::migration;

/// Shared SQLite connection with `run` / `query` / `get` / `transaction`.
#[derive(Clone)]
pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| StoreError::LockPoisoned(e.to_string()))
}

impl SqliteDriver {
    /// Open a database file, creating and migrating it as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Execute a statement; returns the number of changed rows.
    pub async fn run(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<usize> {
        let sql = sql.into();
        self.blocking(move |conn| Ok(conn.execute(&sql, params_from_iter(params.iter()))?))
            .await
    }

    /// Run a query and map every row.
    pub async fn query<T, F>(&self, sql: impl Into<String>, params: Vec<Value>, map: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let sql = sql.into();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| map(row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Run a query expected to return at most one row.
    pub async fn get<T, F>(&self, sql: impl Into<String>, params: Vec<Value>, map: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let sql = sql.into();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(&sql, params_from_iter(params.iter()), map)
                .optional()?)
        })
        .await
    }

    /// Run `f` inside a transaction; it commits only if `f` returns `Ok`.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}
