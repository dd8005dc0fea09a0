//! # Covalence Perms
//!
//! Access control for CoValues, enforced cryptographically.
//!
//! A CoValue with the `group` ruleset is an access-control list: its
//! transactions assign roles to agents (or to everyone), distribute read keys
//! sealed to each member, rotate keys on revocation and extend parent groups.
//!
//! ## Key Types
//!
//! - [`GroupState`] - Fold of a group's transactions, time-aware role history
//! - [`PermissionResolver`] - Effective roles and read keys across extended groups
//! - [`AgentSecret`] - Signing + sealing secrets of the local agent
//! - [`ReadKey`] - Symmetric key that encrypts private transactions
//!
//! ## Cycles
//!
//! Group extension graphs may contain cycles; every walk carries a visited set
//! and treats a revisited group as granting nothing.

pub mod crypto;
pub mod error;
pub mod group;
pub mod resolver;
pub mod role;

pub use crypto::{seal_context, seal_key, AgentSecret, ReadKey, SealerSecret};
pub use error::{PermsError, Result};
pub use group::{GroupState, GroupTransaction};
pub use resolver::{GroupAvailability, GroupSource, MissingGroup, PermissionResolver};
pub use role::{inherited_role, strongest, Capabilities};
