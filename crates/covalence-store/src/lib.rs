//! # Covalence Store
//!
//! Durable, crash-safe persistence of CoValue headers, session logs and
//! signature checkpoints.
//!
//! ## Overview
//!
//! The [`Store`] trait hides the backend. [`SqliteStore`] runs on
//! [`SqliteDriver`] (`run` / `query` / `get` / `transaction` over rusqlite);
//! [`SledStore`] keeps the same records in sled trees. Both apply forward-only
//! migrations on open and commit every content piece atomically.
//!
//! ## Key Types
//!
//! - [`Store`] - Async persistence interface
//! - [`StoreOutcome`] - Stored / needs correction / missing header
//! - [`StoreQueue`] - Serializes writes and reports each outcome
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covalence_store::{SqliteStore, Store, StoreQueue, WriteReport};
//!
//! async fn example() {
//!     let store: Arc<dyn Store> = Arc::new(SqliteStore::open("covalence.db").unwrap());
//!     let queue = StoreQueue::spawn(store.clone(), Arc::new(|report: WriteReport| {
//!         println!("{} now holds {:?}", report.known().id, report.known().sessions);
//!     }));
//!     // queue.push(piece).await?;
//! }
//! ```
//!
//! ## Checkpoints
//!
//! A session row keeps its last signature. Once more than
//! [`covalence_core::MAX_BYTES_BETWEEN_SIGNATURES`] payload bytes were stored
//! since the previous checkpoint, the batch's signature is also written to
//! `signatureAfter`. Loading splits each session at those indices, so a reader
//! resuming mid-session only re-verifies the suffix after the nearest checkpoint.

pub mod driver;
pub mod error;
pub mod kv;
pub mod migration;
mod plan;
pub mod queue;
pub mod sqlite;
pub mod traits;

pub use driver::SqliteDriver;
pub use error::{Result, StoreError};
pub use kv::SledStore;
pub use queue::{ReportCallback, StoreQueue, WriteReport};
pub use sqlite::SqliteStore;
pub use traits::{Store, StoreOutcome};
