//! Group state: the fold of a group's transactions.
//!
//! Group state is recomputed from the full transaction log whenever it changes.
//! Each change is authorized against the state produced by everything ordered
//! before it, so a revocation takes effect for every later transaction while
//! the role history stays queryable for earlier ones.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use covalence_core::{
    AgentId, CoValueId, EncryptedKey, KeyId, MemberId, Op, Role, SealedKey, TxPosition,
};

use crate::role::strongest;

/// One decoded group transaction.
#[derive(Debug, Clone)]
pub struct GroupTransaction<'a> {
    pub position: TxPosition,
    pub ops: &'a [Op],
}

#[derive(Debug, Clone)]
struct RoleEntry {
    at: TxPosition,
    role: Role,
}

/// Replayed membership, keys and extension edges of one group.
#[derive(Debug, Clone)]
pub struct GroupState {
    id: CoValueId,
    initial_admin: AgentId,

    /// Role history per member, in fold order.
    roles: HashMap<MemberId, Vec<RoleEntry>>,

    /// Read key history, in fold order.
    read_keys: Vec<(TxPosition, KeyId)>,

    sealed: HashMap<(KeyId, AgentId), SealedKey>,
    everyone_keys: HashMap<KeyId, [u8; 32]>,

    /// key -> [(encrypting key, wrapped key)]
    key_for_key: HashMap<KeyId, Vec<(KeyId, EncryptedKey)>>,

    write_keys: HashMap<AgentId, KeyId>,
    parents: BTreeSet<CoValueId>,
    fields: BTreeMap<String, Value>,
    rejected: usize,
}

impl GroupState {
    fn empty(id: CoValueId, initial_admin: AgentId) -> Self {
        Self {
            id,
            initial_admin,
            roles: HashMap::new(),
            read_keys: Vec::new(),
            sealed: HashMap::new(),
            everyone_keys: HashMap::new(),
            key_for_key: HashMap::new(),
            write_keys: HashMap::new(),
            parents: BTreeSet::new(),
            fields: BTreeMap::new(),
            rejected: 0,
        }
    }

    /// Replay group transactions in `(madeAt, sessionID, idx)` order.
    pub fn fold<'a>(
        id: CoValueId,
        initial_admin: AgentId,
        transactions: impl IntoIterator<Item = GroupTransaction<'a>>,
    ) -> Self {
        let mut ordered: Vec<_> = transactions.into_iter().collect();
        ordered.sort_by(|a, b| a.position.cmp(&b.position));

        let mut state = Self::empty(id, initial_admin);
        for tx in ordered {
            let author = *tx.position.session.agent();
            for op in tx.ops {
                if !state.apply(&author, &tx.position, op) {
                    state.rejected += 1;
                    tracing::debug!(
                        group = %state.id,
                        author = ?author,
                        "rejected unauthorized group change"
                    );
                }
            }
        }
        state
    }

    /// Apply one change; returns false when the author may not make it.
    fn apply(&mut self, author: &AgentId, at: &TxPosition, op: &Op) -> bool {
        let author_role = self.direct_role(&MemberId::Agent(*author), None);
        let is_admin = author_role.map_or(false, Role::is_admin);

        match op {
            Op::SetRole { member, role } => {
                let is_self = *member == MemberId::Agent(*author);
                let bootstrap = is_self
                    && *role == Role::Admin
                    && *author == self.initial_admin
                    && !self.roles.contains_key(member);
                let leaving = is_self && *role == Role::Revoked && author_role.is_some();
                let everyone_admin = *member == MemberId::Everyone && *role == Role::Admin;
                if everyone_admin || !(is_admin || bootstrap || leaving) {
                    return false;
                }
                self.roles.entry(*member).or_default().push(RoleEntry {
                    at: *at,
                    role: *role,
                });
                true
            }
            _ if op.is_group_op() || matches!(op, Op::Set { .. } | Op::Del { .. }) => {
                if !is_admin {
                    return false;
                }
                self.apply_admin_op(at, op);
                true
            }
            // Non-group ops carry no meaning in a group.
            _ => true,
        }
    }

    fn apply_admin_op(&mut self, at: &TxPosition, op: &Op) {
        match op {
            Op::RevealKey { key, to, sealed } => {
                self.sealed.insert((*key, *to), sealed.clone());
            }
            Op::RevealKeyToEveryone { key, secret } => {
                self.everyone_keys.insert(*key, *secret);
            }
            Op::SetReadKey { key } => self.read_keys.push((*at, *key)),
            Op::KeyForKey {
                key,
                encrypting_key,
                encrypted,
            } => self
                .key_for_key
                .entry(*key)
                .or_default()
                .push((*encrypting_key, encrypted.clone())),
            Op::SetWriteKey { member, key } => {
                self.write_keys.insert(*member, *key);
            }
            Op::Extend { parent } => {
                if *parent != self.id {
                    self.parents.insert(*parent);
                }
            }
            Op::Set { key, value } => {
                self.fields.insert(key.clone(), value.clone());
            }
            Op::Del { key } => {
                self.fields.remove(key);
            }
            _ => {}
        }
    }

    /// Last role assigned to `member` strictly before `before` (or latest).
    fn direct_role(&self, member: &MemberId, before: Option<&TxPosition>) -> Option<Role> {
        let history = self.roles.get(member)?;
        let end = match before {
            Some(at) => history.partition_point(|entry| entry.at < *at),
            None => history.len(),
        };
        end.checked_sub(1).map(|i| history[i].role)
    }

    /// Role of `agent` in this group alone (direct + everyone), as of `before`.
    pub fn role_at(&self, agent: &AgentId, before: Option<&TxPosition>) -> Option<Role> {
        strongest(
            self.direct_role(&MemberId::Agent(*agent), before),
            self.direct_role(&MemberId::Everyone, before),
        )
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn initial_admin(&self) -> &AgentId {
        &self.initial_admin
    }

    /// Current role of every member that has one (revoked members excluded).
    pub fn members(&self) -> BTreeMap<MemberId, Role> {
        self.roles
            .iter()
            .filter_map(|(member, history)| {
                history
                    .last()
                    .filter(|entry| entry.role != Role::Revoked)
                    .map(|entry| (*member, entry.role))
            })
            .collect()
    }

    /// Agents currently able to read.
    pub fn readers(&self) -> Vec<AgentId> {
        self.members()
            .into_iter()
            .filter_map(|(member, role)| match member {
                MemberId::Agent(agent) if role.can_read() => Some(agent),
                _ => None,
            })
            .collect()
    }

    pub fn current_read_key(&self) -> Option<KeyId> {
        self.read_keys.last().map(|(_, key)| *key)
    }

    /// Every read key this group has used, oldest first.
    pub fn read_key_history(&self) -> impl Iterator<Item = &KeyId> {
        self.read_keys.iter().map(|(_, key)| key)
    }

    pub fn sealed_for(&self, key: &KeyId, agent: &AgentId) -> Option<&SealedKey> {
        self.sealed.get(&(*key, *agent))
    }

    pub fn everyone_key(&self, key: &KeyId) -> Option<&[u8; 32]> {
        self.everyone_keys.get(key)
    }

    /// Wrapped copies of `key`, each with the key that encrypts it.
    pub fn wrappings_of(&self, key: &KeyId) -> &[(KeyId, EncryptedKey)] {
        self.key_for_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn write_key_for(&self, agent: &AgentId) -> Option<&KeyId> {
        self.write_keys.get(agent)
    }

    pub fn parents(&self) -> &BTreeSet<CoValueId> {
        &self.parents
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Number of changes dropped as unauthorized during the fold.
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}
