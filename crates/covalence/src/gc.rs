//! Unmounting idle CoValues from memory.
//!
//! Collection only ever drops the in-memory copy. An entry qualifies when it
//! has been idle longer than `max_age`, nobody watches it, no other
//! in-memory value depends on it, no client peer is subscribed to it, and
//! every storage peer has confirmed holding everything we know. Content
//! merely queued for storage does not count.

use std::collections::HashSet;
use std::time::Instant;

use tokio::task::JoinHandle;

use covalence_core::CoValueId;
use covalence_sync::PeerRole;

use crate::config::GcConfig;
use crate::covalue_core::CoValueState;
use crate::covalues_store::lock;
use crate::node::LocalNode;

/// Periodic collector for one node.
pub struct GarbageCollector {
    node: LocalNode,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(node: LocalNode, config: GcConfig) -> Self {
        Self { node, config }
    }

    /// Collect entries idle as of now. Returns the number unmounted.
    pub fn run_once(&self) -> usize {
        self.run_at(Instant::now())
    }

    /// Collect entries idle as of `now`.
    pub fn run_at(&self, now: Instant) -> usize {
        let inner = &self.node.inner;
        let entries = inner.covalues.entries();
        let peers = inner.peers.all();
        let storage: Vec<_> = peers
            .iter()
            .filter(|entry| entry.role() == PeerRole::Storage)
            .collect();

        let mut depended: HashSet<CoValueId> = HashSet::new();
        for (_, cell) in &entries {
            let mut core = lock(cell);
            if core.state() == CoValueState::Available {
                depended.extend(core.depended_on_covalues());
            }
        }

        let mut collected = 0;
        for (id, cell) in entries {
            if depended.contains(&id) {
                continue;
            }
            let watched_by_client = peers.iter().any(|entry| {
                entry.role() == PeerRole::Client && lock(&entry.state).is_subscribed(&id)
            });
            if watched_by_client {
                continue;
            }

            let mut core = lock(&cell);
            if core.has_subscribers() {
                continue;
            }
            if now.saturating_duration_since(core.last_accessed()) < self.config.max_age {
                continue;
            }
            match core.state() {
                CoValueState::Loading => continue,
                CoValueState::Available => {
                    if storage.is_empty() {
                        continue;
                    }
                    let ours = core.known_state();
                    let persisted = storage.iter().all(|entry| {
                        lock(&entry.state)
                            .confirmed(&id)
                            .map_or(false, |theirs| ours.is_subset_of(theirs))
                    });
                    if !persisted {
                        continue;
                    }
                }
                CoValueState::Unknown | CoValueState::Unavailable => {}
            }

            core.unmount();
            drop(core);
            inner.covalues.remove(&id);
            for entry in &peers {
                lock(&entry.state).forget(&id);
            }
            collected += 1;
        }

        if collected > 0 {
            tracing::debug!(collected, remaining = inner.covalues.len(), "garbage collected");
        }
        collected
    }

    /// Run on the configured interval until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once();
            }
        })
    }
}

impl LocalNode {
    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.clone(), self.inner.config.gc.clone())
    }

    /// Start periodic collection with the node's [`GcConfig`].
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        self.garbage_collector().spawn()
    }
}
