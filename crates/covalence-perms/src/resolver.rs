//! Permission resolution across extended groups.
//!
//! Effective role of an agent in a group = direct membership, then the
//! `everyone` entry, then every transitively extended parent group. Read keys
//! are found through sealed reveals, `everyone` reveals and key-for-key chains
//! that may cross into parent groups. Both walks carry a visited set so cyclic
//! extension graphs terminate.

use std::collections::HashSet;
use std::sync::Arc;

use covalence_core::{AgentId, CoValueId, KeyId, Role, TxPosition};

use crate::crypto::{seal_context, AgentSecret, ReadKey};
use crate::group::GroupState;
use crate::role::{inherited_role, strongest};

/// Availability of a group as seen by the resolver.
#[derive(Debug, Clone)]
pub enum GroupAvailability {
    Available(Arc<GroupState>),
    /// Not loaded yet; resolution must wait.
    Pending,
    /// No provider has it; treated as granting nothing.
    Unavailable,
}

/// Source of group states (typically the node's CoValue registry).
pub trait GroupSource {
    fn group(&self, id: &CoValueId) -> GroupAvailability;
}

/// A group needed for resolution is still loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingGroup(pub CoValueId);

pub struct PermissionResolver<'a, S: GroupSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: GroupSource + ?Sized> PermissionResolver<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Effective role of `agent` in `group` just before `before` (or now).
    pub fn role_at(
        &self,
        group: &CoValueId,
        agent: &AgentId,
        before: Option<&TxPosition>,
    ) -> Result<Option<Role>, MissingGroup> {
        let mut visited = HashSet::new();
        self.walk_role(group, agent, before, &mut visited)
    }

    /// Current effective role.
    pub fn role_of(&self, group: &CoValueId, agent: &AgentId) -> Result<Option<Role>, MissingGroup> {
        self.role_at(group, agent, None)
    }

    fn walk_role(
        &self,
        group: &CoValueId,
        agent: &AgentId,
        before: Option<&TxPosition>,
        visited: &mut HashSet<CoValueId>,
    ) -> Result<Option<Role>, MissingGroup> {
        if !visited.insert(*group) {
            return Ok(None);
        }
        let state = match self.source.group(group) {
            GroupAvailability::Available(state) => state,
            GroupAvailability::Pending => return Err(MissingGroup(*group)),
            GroupAvailability::Unavailable => return Ok(None),
        };

        let mut role = state.role_at(agent, before);
        for parent in state.parents() {
            let parent_role = self.walk_role(parent, agent, before, visited)?;
            role = strongest(role, parent_role.and_then(inherited_role));
        }
        Ok(role)
    }

    /// Groups reachable through extension that are not loaded yet.
    pub fn missing_groups(&self, group: &CoValueId) -> Vec<CoValueId> {
        let mut missing = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![*group];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            match self.source.group(&id) {
                GroupAvailability::Available(state) => stack.extend(state.parents().iter().copied()),
                GroupAvailability::Pending => missing.push(id),
                GroupAvailability::Unavailable => {}
            }
        }
        missing
    }

    pub fn current_read_key(&self, group: &CoValueId) -> Option<KeyId> {
        match self.source.group(group) {
            GroupAvailability::Available(state) => state.current_read_key(),
            _ => None,
        }
    }

    /// Find the key material for `key` as `me`, if any path grants it.
    pub fn read_key(&self, group: &CoValueId, key: &KeyId, me: &AgentSecret) -> Option<ReadKey> {
        let mut visited = HashSet::new();
        self.find_key(group, key, me, &mut visited)
    }

    /// Key `me` encrypts with: a dedicated write key for writeOnly members,
    /// otherwise the group's current read key.
    pub fn write_key(&self, group: &CoValueId, me: &AgentSecret) -> Option<ReadKey> {
        let GroupAvailability::Available(state) = self.source.group(group) else {
            return None;
        };
        let key = match state.write_key_for(&me.agent_id()) {
            Some(key) => *key,
            None => state.current_read_key()?,
        };
        self.read_key(group, &key, me)
    }

    fn find_key(
        &self,
        group: &CoValueId,
        key: &KeyId,
        me: &AgentSecret,
        visited: &mut HashSet<(CoValueId, KeyId)>,
    ) -> Option<ReadKey> {
        if !visited.insert((*group, *key)) {
            return None;
        }
        let GroupAvailability::Available(state) = self.source.group(group) else {
            return None;
        };

        if let Some(sealed) = state.sealed_for(key, &me.agent_id()) {
            match me.sealer().unseal(sealed, &seal_context(group, key)) {
                Ok(found) if &found.id() == key => return Some(found),
                Ok(_) => tracing::warn!(group = %group, key = %key, "sealed key does not match its id"),
                Err(e) => tracing::debug!(group = %group, key = %key, error = %e, "cannot unseal key"),
            }
        }

        if let Some(secret) = state.everyone_key(key) {
            let found = ReadKey::from_bytes(*secret);
            if &found.id() == key {
                return Some(found);
            }
        }

        for (encrypting_key, wrapped) in state.wrappings_of(key) {
            let outer = self.find_key(group, encrypting_key, me, visited).or_else(|| {
                state
                    .parents()
                    .iter()
                    .find_map(|parent| self.find_key(parent, encrypting_key, me, visited))
            });
            if let Some(outer) = outer {
                if let Ok(found) = outer.unwrap_key(wrapped, key) {
                    return Some(found);
                }
            }
        }

        state
            .parents()
            .iter()
            .find_map(|parent| self.find_key(parent, key, me, visited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::seal_key;
    use crate::group::GroupTransaction;
    use covalence_core::{MemberId, Op, SessionId};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Groups(HashMap<CoValueId, GroupAvailability>);

    impl GroupSource for Groups {
        fn group(&self, id: &CoValueId) -> GroupAvailability {
            self.0.get(id).cloned().unwrap_or(GroupAvailability::Pending)
        }
    }

    fn build(id: CoValueId, admin: &AgentSecret, ops: Vec<Op>) -> GroupAvailability {
        let position = TxPosition::new(1, SessionId::from_parts(admin.agent_id(), [0; 8]), 0);
        let mut all = vec![Op::SetRole {
            member: MemberId::Agent(admin.agent_id()),
            role: Role::Admin,
        }];
        all.extend(ops);
        GroupAvailability::Available(Arc::new(GroupState::fold(
            id,
            admin.agent_id(),
            [GroupTransaction {
                position,
                ops: &all,
            }],
        )))
    }

    #[test]
    fn test_inherited_role_through_parent() {
        let admin = AgentSecret::from_seed(&[1; 32]);
        let member = AgentSecret::from_seed(&[2; 32]);
        let parent = CoValueId::derive(b"parent");
        let child = CoValueId::derive(b"child");

        let mut groups = Groups::default();
        groups.0.insert(
            parent,
            build(
                parent,
                &admin,
                vec![Op::SetRole {
                    member: MemberId::Agent(member.agent_id()),
                    role: Role::Writer,
                }],
            ),
        );
        groups
            .0
            .insert(child, build(child, &admin, vec![Op::Extend { parent }]));

        let resolver = PermissionResolver::new(&groups);
        assert_eq!(
            resolver.role_of(&child, &member.agent_id()),
            Ok(Some(Role::Writer))
        );
    }

    #[test]
    fn test_cyclic_extension_terminates() {
        let admin = AgentSecret::from_seed(&[1; 32]);
        let stranger = AgentSecret::from_seed(&[3; 32]);
        let a = CoValueId::derive(b"a");
        let b = CoValueId::derive(b"b");

        let mut groups = Groups::default();
        groups.0.insert(a, build(a, &admin, vec![Op::Extend { parent: b }]));
        groups.0.insert(b, build(b, &admin, vec![Op::Extend { parent: a }]));

        let resolver = PermissionResolver::new(&groups);
        assert_eq!(resolver.role_of(&a, &stranger.agent_id()), Ok(None));
        assert_eq!(
            resolver.role_of(&a, &admin.agent_id()),
            Ok(Some(Role::Admin))
        );
        assert!(resolver.missing_groups(&a).is_empty());
    }

    #[test]
    fn test_missing_parent_reported() {
        let admin = AgentSecret::from_seed(&[1; 32]);
        let child = CoValueId::derive(b"child");
        let parent = CoValueId::derive(b"not-loaded");
        let mut groups = Groups::default();
        groups
            .0
            .insert(child, build(child, &admin, vec![Op::Extend { parent }]));

        let resolver = PermissionResolver::new(&groups);
        assert_eq!(
            resolver.role_of(&child, &admin.agent_id()),
            Err(MissingGroup(parent))
        );
        assert_eq!(resolver.missing_groups(&child), vec![parent]);

        groups.0.insert(parent, GroupAvailability::Unavailable);
        let resolver = PermissionResolver::new(&groups);
        assert_eq!(
            resolver.role_of(&child, &admin.agent_id()),
            Ok(Some(Role::Admin))
        );
    }

    #[test]
    fn test_read_key_via_parent_wrapping() {
        let admin = AgentSecret::from_seed(&[1; 32]);
        let reader = AgentSecret::from_seed(&[4; 32]);
        let parent = CoValueId::derive(b"parent");
        let child = CoValueId::derive(b"child");

        let parent_key = ReadKey::generate();
        let child_key = ReadKey::generate();
        let sealed = seal_key(
            &parent_key,
            &reader.agent_id().sealer,
            &seal_context(&parent, &parent_key.id()),
        )
        .unwrap();

        let mut groups = Groups::default();
        groups.0.insert(
            parent,
            build(
                parent,
                &admin,
                vec![
                    Op::SetReadKey {
                        key: parent_key.id(),
                    },
                    Op::RevealKey {
                        key: parent_key.id(),
                        to: reader.agent_id(),
                        sealed,
                    },
                ],
            ),
        );
        groups.0.insert(
            child,
            build(
                child,
                &admin,
                vec![
                    Op::Extend { parent },
                    Op::SetReadKey {
                        key: child_key.id(),
                    },
                    Op::KeyForKey {
                        key: child_key.id(),
                        encrypting_key: parent_key.id(),
                        encrypted: parent_key.wrap(&child_key).unwrap(),
                    },
                ],
            ),
        );

        let resolver = PermissionResolver::new(&groups);
        assert_eq!(resolver.current_read_key(&child), Some(child_key.id()));
        assert_eq!(
            resolver.read_key(&child, &child_key.id(), &reader),
            Some(child_key.clone())
        );
        let outsider = AgentSecret::from_seed(&[5; 32]);
        assert_eq!(resolver.read_key(&child, &child_key.id(), &outsider), None);
    }

    #[test]
    fn test_everyone_key() {
        let admin = AgentSecret::from_seed(&[1; 32]);
        let public = CoValueId::derive(b"public");
        let key = ReadKey::generate();
        let mut groups = Groups::default();
        groups.0.insert(
            public,
            build(
                public,
                &admin,
                vec![Op::RevealKeyToEveryone {
                    key: key.id(),
                    secret: *key.as_bytes(),
                }],
            ),
        );
        let resolver = PermissionResolver::new(&groups);
        let anyone = AgentSecret::from_seed(&[8; 32]);
        assert_eq!(resolver.read_key(&public, &key.id(), &anyone), Some(key));
    }
}
