//! Registry of the CoValues a node holds in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use covalence_core::CoValueId;

use crate::covalue_core::CoValueCore;

/// A shared, lockable core.
pub type CoValueCell = Arc<Mutex<CoValueCore>>;

/// Lock a mutex, recovering the data if another holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map from id to core.
///
/// The registry lock is only held while looking up or inserting entries,
/// never while a core is locked.
#[derive(Default)]
pub struct CoValuesStore {
    entries: Mutex<HashMap<CoValueId, CoValueCell>>,
}

impl CoValuesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &CoValueId) -> Option<CoValueCell> {
        lock(&self.entries).get(id).cloned()
    }

    /// Existing entry, or a fresh `unknown` one.
    pub fn get_or_create(&self, id: &CoValueId) -> CoValueCell {
        lock(&self.entries)
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(CoValueCore::new(*id))))
            .clone()
    }

    pub fn remove(&self, id: &CoValueId) -> Option<CoValueCell> {
        lock(&self.entries).remove(id)
    }

    pub fn contains(&self, id: &CoValueId) -> bool {
        lock(&self.entries).contains_key(id)
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<(CoValueId, CoValueCell)> {
        lock(&self.entries)
            .iter()
            .map(|(id, cell)| (*id, cell.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
