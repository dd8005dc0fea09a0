//! Group lookups for permission resolution, backed by the node's registry.

use covalence_core::CoValueId;
use covalence_perms::{GroupAvailability, GroupSource};

use crate::covalue_core::CoValueState;
use crate::covalues_store::{lock, CoValuesStore};

/// Resolves groups from in-memory cores.
///
/// `held` names a core the caller already has locked; it is reported as
/// unavailable instead of being locked again. Only a non-group value can be
/// held while resolving, so nothing is lost.
pub(crate) struct RegistryGroups<'a> {
    covalues: &'a CoValuesStore,
    held: Option<CoValueId>,
}

impl<'a> RegistryGroups<'a> {
    pub(crate) fn new(covalues: &'a CoValuesStore) -> Self {
        Self {
            covalues,
            held: None,
        }
    }

    pub(crate) fn holding(covalues: &'a CoValuesStore, held: CoValueId) -> Self {
        Self {
            covalues,
            held: Some(held),
        }
    }
}

impl GroupSource for RegistryGroups<'_> {
    fn group(&self, id: &CoValueId) -> GroupAvailability {
        if self.held.as_ref() == Some(id) {
            return GroupAvailability::Unavailable;
        }
        let Some(cell) = self.covalues.get(id) else {
            return GroupAvailability::Pending;
        };
        let mut core = lock(&cell);
        match core.state() {
            CoValueState::Available => match core.group_state() {
                Some(state) => GroupAvailability::Available(state),
                None => GroupAvailability::Unavailable,
            },
            CoValueState::Unavailable => GroupAvailability::Unavailable,
            CoValueState::Unknown | CoValueState::Loading => GroupAvailability::Pending,
        }
    }
}
