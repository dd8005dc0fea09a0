//! LocalNode: one agent's view of the CoValue graph.
//!
//! The node owns the in-memory registry, signs local changes into its own
//! session, and hands every accepted change to the sync manager. All
//! methods that touch cores are synchronous; only loading waits on peers.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use covalence_core::{
    encode_changes, AgentId, CoValueHeader, CoValueId, CoValueType, HeaderMeta, KnownState,
    MemberId, Op, OpId, Role, Ruleset, SessionId, Transaction,
};
use covalence_perms::{
    seal_context, seal_key, AgentSecret, GroupState, MissingGroup, PermissionResolver, ReadKey,
};
use covalence_sync::{PeerId, PeerSyncState, Priority};

use crate::access::RegistryGroups;
use crate::clock::{Clock, SystemClock};
use crate::config::NodeConfig;
use crate::content::CoValueContent;
use crate::covalue_core::{CoValueState, Provenance};
use crate::covalues_store::{lock, CoValueCell, CoValuesStore};
use crate::error::{NodeError, Result};
use crate::sync_manager::Peers;

/// A local participant in the sync graph.
///
/// Cloning is cheap; clones share the same registry and peers.
#[derive(Clone)]
pub struct LocalNode {
    pub(crate) inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) agent: AgentSecret,
    pub(crate) session: SessionId,
    pub(crate) config: NodeConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) covalues: CoValuesStore,
    pub(crate) peers: Peers,
    last_made_at: Mutex<i64>,
}

impl LocalNode {
    pub fn new(agent: AgentSecret, config: NodeConfig) -> Self {
        Self::with_clock(agent, config, Arc::new(SystemClock))
    }

    pub fn with_clock(agent: AgentSecret, config: NodeConfig, clock: Arc<dyn Clock>) -> Self {
        let session = SessionId::new_random(agent.agent_id());
        tracing::info!(agent = %agent.agent_id(), %session, "starting node");
        Self {
            inner: Arc::new(NodeInner {
                agent,
                session,
                config,
                clock,
                covalues: CoValuesStore::new(),
                peers: Peers::default(),
                last_made_at: Mutex::new(i64::MIN),
            }),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.inner.agent.agent_id()
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn covalues(&self) -> &CoValuesStore {
        &self.inner.covalues
    }

    /// `madeAt` for the next local transaction; strictly increasing.
    fn next_made_at(&self) -> i64 {
        let mut last = lock(&self.inner.last_made_at);
        let now = self.inner.clock.now_millis().max(last.saturating_add(1));
        *last = now;
        now
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating CoValues
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group with this agent as its initial admin and a first read key.
    pub fn create_group(&self) -> Result<CoValueId> {
        let me = self.agent_id();
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::Group { initial_admin: me })
            .created_at(self.next_made_at());
        let id = self.register_local(header);

        let key = ReadKey::generate();
        let key_id = key.id();
        let sealed = seal_key(&key, &me.sealer, &seal_context(&id, &key_id))?;
        let ops = vec![
            Op::SetRole {
                member: me.into(),
                role: Role::Admin,
            },
            Op::RevealKey {
                key: key_id,
                to: me,
                sealed,
            },
            Op::SetReadKey { key: key_id },
        ];
        self.transact(&id, move |_| Ok(ops))?;
        tracing::info!(group = %id, "created group");
        Ok(id)
    }

    /// Create a CoValue owned by `group`. Requires write access.
    pub fn create_covalue(
        &self,
        kind: CoValueType,
        group: &CoValueId,
        meta: Option<HeaderMeta>,
    ) -> Result<CoValueId> {
        self.require_write(group)?;
        let mut header = CoValueHeader::new(kind, Ruleset::OwnedByGroup { group: *group })
            .created_at(self.next_made_at());
        if let Some(meta) = meta {
            header = header.with_meta(meta);
        }
        let id = self.register_local(header);
        self.broadcast(&id);
        tracing::debug!(covalue = %id, ?kind, %group, "created covalue");
        Ok(id)
    }

    /// Create a CoValue anyone may write to.
    pub fn create_unsafe(&self, kind: CoValueType) -> Result<CoValueId> {
        let header =
            CoValueHeader::new(kind, Ruleset::UnsafeAllowAll).created_at(self.next_made_at());
        let id = self.register_local(header);
        self.broadcast(&id);
        Ok(id)
    }

    pub fn create_map(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_covalue(CoValueType::CoMap, group, None)
    }

    pub fn create_list(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_covalue(CoValueType::CoList, group, None)
    }

    pub fn create_stream(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_covalue(CoValueType::CoStream, group, None)
    }

    pub fn create_binary_stream(
        &self,
        group: &CoValueId,
        mime_type: &str,
        file_name: Option<&str>,
    ) -> Result<CoValueId> {
        let meta = HeaderMeta::Binary {
            mime_type: mime_type.to_string(),
            file_name: file_name.map(str::to_string),
        };
        self.create_covalue(CoValueType::CoStream, group, Some(meta))
    }

    pub fn create_plain_text(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_covalue(CoValueType::CoPlainText, group, None)
    }

    pub fn create_rich_text(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_covalue(CoValueType::CoRichText, group, None)
    }

    fn register_local(&self, header: CoValueHeader) -> CoValueId {
        let id = header.id();
        let cell = self.inner.covalues.get_or_create(&id);
        let mut core = lock(&cell);
        // A locally built header always hashes to its own id.
        if let Err(e) = core.mark_available(header, Provenance::Local) {
            tracing::error!(covalue = %id, error = %e, "local header rejected");
        }
        id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set(&self, id: &CoValueId, key: &str, value: Value) -> Result<()> {
        self.expect_kind(id, &[CoValueType::CoMap])?;
        let op = Op::Set {
            key: key.to_string(),
            value,
        };
        self.transact(id, move |_| Ok(vec![op]))
    }

    pub fn delete(&self, id: &CoValueId, key: &str) -> Result<()> {
        self.expect_kind(id, &[CoValueType::CoMap])?;
        let op = Op::Del {
            key: key.to_string(),
        };
        self.transact(id, move |_| Ok(vec![op]))
    }

    pub fn list_push(&self, id: &CoValueId, value: Value) -> Result<()> {
        let len = self.list_snapshot(id)?.len();
        self.list_insert(id, len, value)
    }

    /// Insert so that `value` ends up at `index`.
    pub fn list_insert(&self, id: &CoValueId, index: usize, value: Value) -> Result<()> {
        let list = self.list_snapshot(id)?;
        if index > list.len() {
            return Err(NodeError::InvalidOperation(format!(
                "index {index} out of bounds for list of {}",
                list.len()
            )));
        }
        let after = index.checked_sub(1).and_then(|i| list.id_at(i));
        self.transact(id, move |_| Ok(vec![Op::Insert { after, value }]))
    }

    pub fn list_remove(&self, id: &CoValueId, index: usize) -> Result<()> {
        let list = self.list_snapshot(id)?;
        let target = list.id_at(index).ok_or_else(|| {
            NodeError::InvalidOperation(format!("no list item at index {index}"))
        })?;
        self.transact(id, move |_| Ok(vec![Op::Remove { target }]))
    }

    pub fn stream_push(&self, id: &CoValueId, item: Value) -> Result<()> {
        self.expect_kind(id, &[CoValueType::CoStream])?;
        self.transact(id, move |_| Ok(vec![Op::Append { item }]))
    }

    /// Insert `text` before the character at `index`.
    pub fn text_insert(&self, id: &CoValueId, index: usize, text: &str) -> Result<()> {
        let snapshot = self.content(id)?;
        let current = snapshot
            .as_text()
            .ok_or_else(|| NodeError::InvalidOperation("not a text value".into()))?;
        if index > current.len() {
            return Err(NodeError::InvalidOperation(format!(
                "index {index} out of bounds for text of {}",
                current.len()
            )));
        }
        if text.is_empty() {
            return Ok(());
        }
        let anchor = index.checked_sub(1).and_then(|i| current.id_at(i));
        let session = self.inner.session;
        let chars: Vec<String> = text.chars().map(String::from).collect();
        self.transact(id, move |tx| {
            Ok(chars
                .into_iter()
                .enumerate()
                .map(|(n, ch)| Op::Insert {
                    after: match n {
                        0 => anchor,
                        n => Some(OpId {
                            session,
                            tx,
                            change: n as u32 - 1,
                        }),
                    },
                    value: Value::String(ch),
                })
                .collect())
        })
    }

    pub fn text_delete(&self, id: &CoValueId, index: usize, count: usize) -> Result<()> {
        let snapshot = self.content(id)?;
        let current = snapshot
            .as_text()
            .ok_or_else(|| NodeError::InvalidOperation("not a text value".into()))?;
        let ops: Vec<Op> = (index..index.saturating_add(count))
            .map_while(|i| current.id_at(i))
            .map(|target| Op::Remove { target })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.transact(id, move |_| Ok(ops))
    }

    fn list_snapshot(&self, id: &CoValueId) -> Result<crate::content::CoListContent> {
        match self.content(id)? {
            CoValueContent::CoList(list) => Ok(list),
            _ => Err(NodeError::InvalidOperation("not a list".into())),
        }
    }

    fn expect_kind(&self, id: &CoValueId, kinds: &[CoValueType]) -> Result<()> {
        let cell = self.available_cell(id)?;
        let core = lock(&cell);
        match core.header() {
            Some(header) if header.is_group() => Err(NodeError::InvalidOperation(
                "use the group operations to change a group".into(),
            )),
            Some(header) if kinds.contains(&header.kind) => Ok(()),
            Some(header) => Err(NodeError::InvalidOperation(format!(
                "operation not supported on {:?}",
                header.kind
            ))),
            None => Err(NodeError::Unavailable(*id)),
        }
    }

    /// Sign one local transaction built by `build` (given its index in this
    /// node's session) and sync it out.
    pub(crate) fn transact(
        &self,
        id: &CoValueId,
        build: impl FnOnce(u32) -> Result<Vec<Op>>,
    ) -> Result<()> {
        let cell = self.available_cell(id)?;
        let header = lock(&cell)
            .header()
            .cloned()
            .ok_or(NodeError::Unavailable(*id))?;
        let session = self.inner.session;

        let write_key = match &header.ruleset {
            Ruleset::OwnedByGroup { group } => {
                self.require_write(group)?;
                let groups = RegistryGroups::new(&self.inner.covalues);
                let resolver = PermissionResolver::new(&groups);
                Some(resolver.write_key(group, &self.inner.agent).ok_or_else(|| {
                    NodeError::Unauthorized(format!("no write key for group {group}"))
                })?)
            }
            Ruleset::Group { .. } | Ruleset::UnsafeAllowAll => None,
        };

        let made_at = self.next_made_at();
        {
            let mut core = lock(&cell);
            let idx = core.session_len(&session);
            let ops = build(idx)?;
            let tx = match &write_key {
                Some(key) => {
                    let plaintext = encode_changes(&ops)?;
                    let nonce = ReadKey::transaction_nonce(id, &session, idx);
                    Transaction::Private {
                        made_at,
                        key_used: key.id(),
                        encrypted_changes: key.encrypt(plaintext.as_bytes(), &nonce)?,
                        meta: None,
                    }
                }
                None => Transaction::trusting(made_at, &ops)?,
            };
            core.append_local(session, self.inner.agent.signer(), &[tx])?;
        }

        self.broadcast(id);
        Ok(())
    }

    /// Fail unless this agent can currently write in `group`.
    fn require_write(&self, group: &CoValueId) -> Result<()> {
        let groups = RegistryGroups::new(&self.inner.covalues);
        let resolver = PermissionResolver::new(&groups);
        match resolver.role_of(group, &self.agent_id()) {
            Ok(Some(role)) if role.can_write() => Ok(()),
            Ok(role) => Err(NodeError::Unauthorized(format!(
                "{} has role {role:?} in {group}",
                self.agent_id()
            ))),
            Err(MissingGroup(missing)) => Err(NodeError::MissingDependency(vec![missing])),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Group Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Grant `role` to `member`, revealing the current read key when the role
    /// can read. writeOnly members get a dedicated write key instead.
    pub fn add_member(&self, group: &CoValueId, member: impl Into<MemberId>, role: Role) -> Result<()> {
        let member = member.into();
        let state = self.group_state(group)?;
        self.require_admin(&state)?;

        let groups = RegistryGroups::new(&self.inner.covalues);
        let resolver = PermissionResolver::new(&groups);
        let me = &self.inner.agent;
        let current = state
            .current_read_key()
            .and_then(|key| resolver.read_key(group, &key, me));

        let mut ops = vec![Op::SetRole { member, role }];
        match member {
            MemberId::Agent(agent) => {
                if role.can_read() {
                    let key = current.as_ref().ok_or_else(|| {
                        NodeError::Unauthorized(format!("read key of {group} not available"))
                    })?;
                    ops.push(reveal(group, key, &agent)?);
                }
                if role == Role::WriteOnly {
                    let write_key = ReadKey::generate();
                    ops.push(reveal(group, &write_key, &agent)?);
                    if let Some(read) = &current {
                        ops.push(Op::KeyForKey {
                            key: write_key.id(),
                            encrypting_key: read.id(),
                            encrypted: read.wrap(&write_key)?,
                        });
                    }
                    ops.push(Op::SetWriteKey {
                        member: agent,
                        key: write_key.id(),
                    });
                }
            }
            MemberId::Everyone => {
                if matches!(role, Role::Admin | Role::WriteOnly) {
                    return Err(NodeError::InvalidOperation(format!(
                        "everyone cannot be given role {role:?}"
                    )));
                }
                if role.can_read() {
                    let key = current.as_ref().ok_or_else(|| {
                        NodeError::Unauthorized(format!("read key of {group} not available"))
                    })?;
                    ops.push(Op::RevealKeyToEveryone {
                        key: key.id(),
                        secret: *key.as_bytes(),
                    });
                }
            }
        }

        self.transact(group, move |_| Ok(ops))?;
        tracing::info!(%group, ?member, ?role, "member added");
        Ok(())
    }

    /// Revoke `agent` and rotate the read key so later content is sealed
    /// away from them. A non-admin may only revoke themselves.
    pub fn remove_member(&self, group: &CoValueId, agent: &AgentId) -> Result<()> {
        let state = self.group_state(group)?;
        let me = self.agent_id();
        let is_admin = state.role_at(&me, None).map_or(false, Role::is_admin);
        if !is_admin && *agent != me {
            return Err(NodeError::Unauthorized(format!(
                "{me} cannot remove members of {group}"
            )));
        }

        let mut ops = vec![Op::SetRole {
            member: (*agent).into(),
            role: Role::Revoked,
        }];
        if is_admin {
            ops.extend(self.rotation_ops(group, &state, Some(agent))?);
        }
        self.transact(group, move |_| Ok(ops))?;
        tracing::info!(%group, member = %agent, "member revoked");
        Ok(())
    }

    /// Ops introducing a fresh read key for `group`, revealed to every
    /// remaining reader and readable through the old key's chain.
    fn rotation_ops(
        &self,
        group: &CoValueId,
        state: &GroupState,
        excluded: Option<&AgentId>,
    ) -> Result<Vec<Op>> {
        let groups = RegistryGroups::new(&self.inner.covalues);
        let resolver = PermissionResolver::new(&groups);
        let me = &self.inner.agent;
        let new_key = ReadKey::generate();
        let mut ops = Vec::new();

        for reader in state.readers() {
            if Some(&reader) != excluded {
                ops.push(reveal(group, &new_key, &reader)?);
            }
        }
        let everyone_reads = state
            .members()
            .get(&MemberId::Everyone)
            .map_or(false, |role| role.can_read());
        if everyone_reads {
            ops.push(Op::RevealKeyToEveryone {
                key: new_key.id(),
                secret: *new_key.as_bytes(),
            });
        }
        if let Some(old) = state
            .current_read_key()
            .and_then(|key| resolver.read_key(group, &key, me))
        {
            ops.push(Op::KeyForKey {
                key: old.id(),
                encrypting_key: new_key.id(),
                encrypted: new_key.wrap(&old)?,
            });
        }
        for parent in state.parents() {
            let parent_key = resolver
                .current_read_key(parent)
                .and_then(|key| resolver.read_key(parent, &key, me));
            if let Some(parent_key) = parent_key {
                ops.push(Op::KeyForKey {
                    key: new_key.id(),
                    encrypting_key: parent_key.id(),
                    encrypted: parent_key.wrap(&new_key)?,
                });
            }
        }
        ops.push(Op::SetReadKey { key: new_key.id() });
        Ok(ops)
    }

    /// Make `child` inherit members from `parent`.
    pub fn extend(&self, child: &CoValueId, parent: &CoValueId) -> Result<()> {
        let state = self.group_state(child)?;
        self.require_admin(&state)?;
        self.group_state(parent)?;

        let groups = RegistryGroups::new(&self.inner.covalues);
        let resolver = PermissionResolver::new(&groups);
        let me = &self.inner.agent;
        let mut ops = vec![Op::Extend { parent: *parent }];
        let child_key = state
            .current_read_key()
            .and_then(|key| resolver.read_key(child, &key, me));
        let parent_key = resolver
            .current_read_key(parent)
            .and_then(|key| resolver.read_key(parent, &key, me));
        if let (Some(child_key), Some(parent_key)) = (child_key, parent_key) {
            ops.push(Op::KeyForKey {
                key: child_key.id(),
                encrypting_key: parent_key.id(),
                encrypted: parent_key.wrap(&child_key)?,
            });
        }
        self.transact(child, move |_| Ok(ops))?;
        tracing::info!(%child, %parent, "group extended");
        Ok(())
    }

    fn require_admin(&self, state: &GroupState) -> Result<()> {
        let me = self.agent_id();
        if state.role_at(&me, None).map_or(false, Role::is_admin) {
            Ok(())
        } else {
            Err(NodeError::Unauthorized(format!(
                "{me} is not an admin of {}",
                state.id()
            )))
        }
    }

    fn group_state(&self, group: &CoValueId) -> Result<Arc<GroupState>> {
        let cell = self.available_cell(group)?;
        let mut core = lock(&cell);
        core.group_state()
            .ok_or_else(|| NodeError::InvalidOperation(format!("{group} is not a group")))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Current content as this agent may see it.
    pub fn content(&self, id: &CoValueId) -> Result<CoValueContent> {
        let cell = self.available_cell(id)?;
        let groups = RegistryGroups::holding(&self.inner.covalues, *id);
        let resolver = PermissionResolver::new(&groups);
        let result = lock(&cell).content(&resolver, &self.inner.agent);
        if let Err(NodeError::MissingDependency(missing)) = &result {
            for group in missing {
                self.request_group_load(group);
            }
        }
        result
    }

    /// Like [`content`](Self::content), but waits while the groups needed to
    /// decide permissions are loading. A group no peer can provide surfaces
    /// as `MissingDependency`.
    pub async fn content_when_ready(&self, id: &CoValueId) -> Result<CoValueContent> {
        let mut tried = HashSet::new();
        loop {
            let missing = match self.content(id) {
                Err(NodeError::MissingDependency(missing)) => missing,
                other => return other,
            };
            let fresh: Vec<CoValueId> = missing
                .iter()
                .copied()
                .filter(|group| tried.insert(*group))
                .collect();
            if fresh.is_empty() {
                return Err(NodeError::MissingDependency(missing));
            }
            for group in &fresh {
                match self.load(group).await {
                    Ok(()) | Err(NodeError::Unavailable(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    pub fn state(&self, id: &CoValueId) -> CoValueState {
        self.inner
            .covalues
            .get(id)
            .map_or(CoValueState::Unknown, |cell| lock(&cell).state())
    }

    pub fn known_state(&self, id: &CoValueId) -> Option<KnownState> {
        self.inner
            .covalues
            .get(id)
            .map(|cell| lock(&cell).known_state())
    }

    pub fn header(&self, id: &CoValueId) -> Option<CoValueHeader> {
        self.inner
            .covalues
            .get(id)
            .and_then(|cell| lock(&cell).header().cloned())
    }

    /// Change notifications for an available CoValue.
    pub fn subscribe(&self, id: &CoValueId) -> Result<watch::Receiver<u64>> {
        let cell = self.available_cell(id)?;
        let mut core = lock(&cell);
        Ok(core.subscribe())
    }

    /// Sync state of `id` towards `peer`.
    pub fn sync_state(&self, id: &CoValueId, peer: &PeerId) -> PeerSyncState {
        self.inner
            .peers
            .get(peer)
            .map_or(PeerSyncState::Idle, |entry| lock(&entry.state).sync_state(id))
    }

    pub(crate) fn available_cell(&self, id: &CoValueId) -> Result<CoValueCell> {
        let cell = self
            .inner
            .covalues
            .get(id)
            .ok_or(NodeError::Unavailable(*id))?;
        if lock(&cell).state() != CoValueState::Available {
            return Err(NodeError::Unavailable(*id));
        }
        Ok(cell)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Load `id` and everything it depends on from peers.
    ///
    /// Fails with `Unavailable` when every asked peer reports not having it,
    /// or when none answers within the load timeout.
    pub async fn load(&self, id: &CoValueId) -> Result<()> {
        let mut visited = HashSet::new();
        self.load_with_deps(*id, &mut visited, Priority::Medium).await
    }

    /// Dependencies are owner and parent groups, so they load in the high lane.
    fn load_with_deps<'a>(
        &'a self,
        id: CoValueId,
        visited: &'a mut HashSet<CoValueId>,
        priority: Priority,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !visited.insert(id) {
                return Ok(());
            }
            self.load_one(id, priority).await?;
            let deps = match self.inner.covalues.get(&id) {
                Some(cell) => lock(&cell).depended_on_covalues(),
                None => return Err(NodeError::Unavailable(id)),
            };
            for dep in deps {
                match self.load_with_deps(dep, visited, Priority::High).await {
                    Ok(()) => {}
                    Err(NodeError::Unavailable(missing)) => {
                        tracing::debug!(covalue = %id, dependency = %missing, "dependency unavailable");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    async fn load_one(&self, id: CoValueId, priority: Priority) -> Result<()> {
        let cell = self.inner.covalues.get_or_create(&id);
        let (state, rx) = {
            let core = lock(&cell);
            (core.state(), core.watch_state())
        };
        match state {
            CoValueState::Available => return Ok(()),
            CoValueState::Unknown | CoValueState::Unavailable => {
                self.start_load(&id, None, priority);
            }
            CoValueState::Loading => {}
        }

        match tokio::time::timeout(self.inner.config.load_timeout, wait_resolved(rx)).await {
            Ok(CoValueState::Available) => Ok(()),
            Ok(_) => Err(NodeError::Unavailable(id)),
            Err(_) => {
                tracing::info!(covalue = %id, "load timed out");
                lock(&cell).mark_unavailable();
                self.inner.peers.clear_pending(&id);
                Err(NodeError::Unavailable(id))
            }
        }
    }

    /// Start loading a group in the background if nothing is known about it.
    pub(crate) fn request_group_load(&self, id: &CoValueId) {
        if self.state(id) == CoValueState::Unknown {
            self.start_load(id, None, Priority::High);
        }
    }
}

/// Wait until a core is available or unavailable.
pub(crate) async fn wait_resolved(mut rx: watch::Receiver<CoValueState>) -> CoValueState {
    loop {
        let state = *rx.borrow_and_update();
        if state.is_resolved() {
            return state;
        }
        if rx.changed().await.is_err() {
            return CoValueState::Unavailable;
        }
    }
}

fn reveal(group: &CoValueId, key: &ReadKey, to: &AgentId) -> Result<Op> {
    let sealed = seal_key(key, &to.sealer, &seal_context(group, &key.id()))?;
    Ok(Op::RevealKey {
        key: key.id(),
        to: *to,
        sealed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn node(seed: u8) -> LocalNode {
        LocalNode::with_clock(
            AgentSecret::from_seed(&[seed; 32]),
            NodeConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[test]
    fn test_made_at_is_strictly_increasing() {
        let node = node(1);
        let a = node.next_made_at();
        let b = node.next_made_at();
        assert_eq!(a, 1_000);
        assert_eq!(b, 1_001);
    }

    #[test]
    fn test_private_map_round_trip() {
        let node = node(1);
        let group = node.create_group().unwrap();
        let map = node.create_map(&group).unwrap();
        node.set(&map, "title", json!("draft")).unwrap();
        node.set(&map, "title", json!("final")).unwrap();
        node.delete(&map, "missing").unwrap();

        let content = node.content(&map).unwrap();
        assert_eq!(content.as_map().unwrap().get("title"), Some(&json!("final")));

        let group_content = node.content(&group).unwrap();
        let members = &group_content.as_group().unwrap().members;
        assert_eq!(members.get(&MemberId::Agent(node.agent_id())), Some(&Role::Admin));
    }

    #[test]
    fn test_list_and_text_editing() {
        let node = node(2);
        let group = node.create_group().unwrap();

        let list = node.create_list(&group).unwrap();
        node.list_push(&list, json!("b")).unwrap();
        node.list_insert(&list, 0, json!("a")).unwrap();
        node.list_push(&list, json!("c")).unwrap();
        node.list_remove(&list, 1).unwrap();
        let content = node.content(&list).unwrap();
        assert_eq!(content.as_list().unwrap().items(), &[json!("a"), json!("c")]);

        let text = node.create_plain_text(&group).unwrap();
        node.text_insert(&text, 0, "helo").unwrap();
        node.text_insert(&text, 3, "l").unwrap();
        node.text_insert(&text, 5, " world").unwrap();
        node.text_delete(&text, 0, 1).unwrap();
        let content = node.content(&text).unwrap();
        assert_eq!(content.as_text().unwrap().as_str(), "ello world");

        // A count past the end deletes through the end.
        node.text_delete(&text, 4, usize::MAX).unwrap();
        let content = node.content(&text).unwrap();
        assert_eq!(content.as_text().unwrap().as_str(), "ello");
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let node = node(3);
        let group = node.create_group().unwrap();
        let stream = node.create_stream(&group).unwrap();
        assert!(matches!(
            node.set(&stream, "a", json!(1)),
            Err(NodeError::InvalidOperation(_))
        ));
        assert!(matches!(
            node.set(&group, "a", json!(1)),
            Err(NodeError::InvalidOperation(_))
        ));
        node.stream_push(&stream, json!({"n": 1})).unwrap();
        assert_eq!(node.content(&stream).unwrap().as_stream().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_covalue_is_unavailable() {
        let node = node(4);
        let id = CoValueId::derive(b"nothing");
        assert!(matches!(node.content(&id), Err(NodeError::Unavailable(_))));
        assert_eq!(node.state(&id), CoValueState::Unknown);
    }

    #[tokio::test]
    async fn test_load_without_peers_is_unavailable() {
        let node = node(5);
        let id = CoValueId::derive(b"nothing");
        assert!(matches!(node.load(&id).await, Err(NodeError::Unavailable(_))));
        assert_eq!(node.state(&id), CoValueState::Unavailable);
    }
}
