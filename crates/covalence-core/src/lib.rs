//! # Covalence Core
//!
//! Pure primitives for covalence: identifiers, CoValue headers, transactions
//! and the signed per-session transaction log.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`CoValueHeader`] - Immutable metadata; its hash is the [`CoValueId`]
//! - [`Transaction`] - A trusting (plaintext) or private (encrypted) change set
//! - [`SessionLog`] - Append-only, gap-free transactions of one writer session
//! - [`KnownState`] - Per-session transaction counts used for sync diffing
//! - [`NewContentPiece`] - A signed range of transactions ready to ship
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed over deterministic CBOR. See [`canonical`].

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod header;
pub mod ids;
pub mod known;
pub mod ops;
pub mod piece;
pub mod serde_hex;
pub mod session;
pub mod transaction;

pub use canonical::{canonical_header_bytes, canonical_transaction_bytes};
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair, SealerPublicKey};
pub use error::{CoreError, ValidationError};
pub use header::{CoValueHeader, CoValueType, HeaderMeta, Ruleset};
pub use ids::{AgentId, CoValueId, KeyId, MemberId, SessionId};
pub use known::KnownState;
pub use ops::{
    decode_changes, encode_changes, EncryptedKey, Op, OpId, Role, SealedKey, TxPosition,
};
pub use piece::{NewContentPiece, SessionNewContent};
pub use session::{
    session_signing_message, AppendResult, SessionLog, MAX_BYTES_BETWEEN_SIGNATURES,
};
pub use transaction::Transaction;
