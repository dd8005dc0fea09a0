//! # Covalence
//!
//! Local-first, multi-writer CoValues with verified history,
//! permission-gated merge, peer-to-peer sync and durable storage.
//!
//! ## Overview
//!
//! - **CoValue**: a collaborative value (map, list, stream, text, group)
//!   identified by the hash of its header.
//! - **Session log**: the append-only, signed log of one agent session. A
//!   CoValue's history is the union of its session logs.
//! - **Group**: a CoValue holding roles and sealed read keys. Every other
//!   CoValue is owned by a group, which decides who may read and write it.
//! - **Sync**: nodes exchange `load` / `known` / `content` / `done` messages
//!   until they hold the same transactions; storage is just another peer.
//!
//! Merged content depends only on the set of valid transactions, ordered by
//! `(madeAt, sessionID)`, never on the order they arrived in.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covalence::{LocalNode, NodeConfig};
//! use covalence::perms::AgentSecret;
//! use covalence::store::SqliteStore;
//! use serde_json::json;
//!
//! async fn example() -> covalence::Result<()> {
//!     let node = LocalNode::new(AgentSecret::generate(), NodeConfig::default());
//!     node.add_storage(Arc::new(SqliteStore::open("covalues.db")?));
//!
//!     let group = node.create_group()?;
//!     let doc = node.create_map(&group)?;
//!     node.set(&doc, "title", json!("draft"))?;
//!
//!     let content = node.content(&doc)?;
//!     assert_eq!(content.as_map().and_then(|m| m.get("title")), Some(&json!("draft")));
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `covalence::core` - headers, transactions, session logs, ids
//! - `covalence::perms` - keys, groups and the permission resolver
//! - `covalence::store` - storage backends and the write queue
//! - `covalence::sync` - messages, transports and peer state

mod access;
pub mod clock;
pub mod config;
pub mod content;
pub mod covalue_core;
pub mod covalues_store;
pub mod error;
pub mod gc;
pub mod node;
pub mod sync_manager;

// Re-export component crates
pub use covalence_core as core;
pub use covalence_perms as perms;
pub use covalence_store as store;
pub use covalence_sync as sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GcConfig, NodeConfig};
pub use content::{
    CoListContent, CoMapContent, CoStreamContent, CoValueContent, GroupContent, TextContent,
};
pub use covalue_core::{AddResult, CoValueCore, CoValueState, PieceOutcome, Provenance};
pub use covalues_store::{CoValueCell, CoValuesStore};
pub use error::{NodeError, Result};
pub use gc::GarbageCollector;
pub use node::LocalNode;
pub use sync_manager::PeerHandle;

// Commonly used core types
pub use covalence_core::{
    AgentId, CoValueHeader, CoValueId, CoValueType, HeaderMeta, KnownState, MemberId, Role,
    Ruleset, SessionId,
};
pub use covalence_sync::{PeerConfig, PeerId, PeerRole, PeerSyncState};
