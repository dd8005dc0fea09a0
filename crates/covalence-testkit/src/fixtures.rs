//! Test fixtures and helpers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use covalence::{LocalNode, ManualClock, NodeConfig, PeerConfig, PeerHandle, PeerId, PeerRole};
use covalence_perms::AgentSecret;
use covalence_sync::transport::memory;

const CHANNEL_CAPACITY: usize = 1024;

/// Node configuration with timeouts suited to tests.
pub fn test_config() -> NodeConfig {
    NodeConfig::default().with_load_timeout(Duration::from_secs(2))
}

/// Deterministic agent from a one-byte seed.
pub fn agent(seed: u8) -> AgentSecret {
    AgentSecret::from_seed(&[seed; 32])
}

/// Nodes sharing one manual clock, so `madeAt` is under test control.
pub struct TestNet {
    pub clock: Arc<ManualClock>,
}

impl TestNet {
    pub fn new(start: i64) -> Self {
        Self {
            clock: Arc::new(ManualClock::new(start)),
        }
    }

    pub fn node(&self, seed: u8) -> LocalNode {
        self.node_with_config(seed, test_config())
    }

    pub fn node_with_config(&self, seed: u8, config: NodeConfig) -> LocalNode {
        LocalNode::with_clock(agent(seed), config, self.clock.clone())
    }

    /// Set the clock; the next local transaction gets at least this `madeAt`.
    pub fn at(&self, millis: i64) {
        self.clock.set(millis);
    }
}

/// Connect `client` to `server` over an in-memory pair.
///
/// Returns (client's handle on the server, server's handle on the client).
pub fn connect(client: &LocalNode, server: &LocalNode) -> (PeerHandle, PeerHandle) {
    let (client_end, server_end) = memory::pair(CHANNEL_CAPACITY);
    let to_server = client.add_peer(
        PeerConfig::new(PeerId::random(), PeerRole::Server),
        Arc::new(client_end),
    );
    let to_client = server.add_peer(
        PeerConfig::new(PeerId::random(), PeerRole::Client),
        Arc::new(server_end),
    );
    (to_server, to_client)
}

/// Connect two nodes that each treat the other as a server.
pub fn connect_peers(a: &LocalNode, b: &LocalNode) -> (PeerHandle, PeerHandle) {
    let (a_end, b_end) = memory::pair(CHANNEL_CAPACITY);
    let a_to_b = a.add_peer(
        PeerConfig::new(PeerId::random(), PeerRole::Server),
        Arc::new(a_end),
    );
    let b_to_a = b.add_peer(
        PeerConfig::new(PeerId::random(), PeerRole::Server),
        Arc::new(b_end),
    );
    (a_to_b, b_to_a)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run `future` with a timeout, panicking if it does not finish.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out after {timeout:?}"),
    }
}
