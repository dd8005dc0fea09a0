//! Node configuration.

use std::time::Duration;

use covalence_sync::SyncConfig;

/// Garbage collection of idle in-memory CoValues.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub interval: Duration,
    /// Idle time after which an entry may be unmounted.
    pub max_age: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(10 * 60),
        }
    }
}

/// Configuration for a [`crate::LocalNode`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long a load waits for any peer to provide the header.
    pub load_timeout: Duration,
    pub sync: SyncConfig,
    pub gc: GcConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            sync: SyncConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }
}
