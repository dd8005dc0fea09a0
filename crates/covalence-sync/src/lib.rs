//! # Covalence Sync
//!
//! Wire protocol, outgoing priority queues and transports for syncing
//! CoValues between peers.
//!
//! ## Overview
//!
//! Peers exchange four CoValue-scoped messages. `load` announces a known
//! state and asks for the rest, `known` answers with ours (or, flagged
//! `isCorrection`, asks the sender to resend from exactly that point),
//! `content` carries signed transaction ranges, and `done` closes a round.
//! Frames are newline-delimited JSON; ping/pong keepalives drive the
//! [`ConnectionStatus`] of stream transports.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- load (A's state) ------->|
//!   |<------- known (B's state) -------|
//!   |<------- content (B ahead of A) --|
//!   |<------- done --------------------|
//!   |-------- content (A ahead of B) ->|
//!   |-------- done ------------------->|
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalence_sync::{StreamTransport, SyncConfig, Transport};
//!
//! async fn example() -> covalence_sync::Result<()> {
//!     let transport = StreamTransport::connect("127.0.0.1:4200", SyncConfig::default()).await?;
//!     while let Some(message) = transport.recv().await? {
//!         println!("{}", message.action());
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod messages;
pub mod peer;
pub mod priority;
pub mod reconnect;
pub mod storage_peer;
pub mod stream;
pub mod transport;

pub use codec::{encode_line, LineDecoder};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use messages::SyncMessage;
pub use peer::{PeerConfig, PeerId, PeerRole, PeerState, PeerSyncState};
pub use priority::{OutgoingQueue, Priority, PriorityQueue};
pub use reconnect::{maintain_connection, ReconnectConfig};
pub use storage_peer::spawn_storage_peer;
pub use stream::StreamTransport;
pub use transport::{memory::MemoryTransport, ConnectionStatus, Transport};
