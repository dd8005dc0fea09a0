//! # Covalence Testkit
//!
//! Testing utilities for Covalence.
//!
//! - **Fixtures**: nodes on a shared manual clock, wired together over
//!   in-memory transports
//! - **Generators**: proptest strategies for edits and agents
//!
//! ```rust,ignore
//! use covalence_testkit::fixtures::{connect, eventually, TestNet};
//!
//! let net = TestNet::new(1_000);
//! let (a, b) = (net.node(1), net.node(2));
//! connect(&b, &a);
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{agent, connect, connect_peers, eventually, test_config, within, TestNet};
