//! Sync manager: drives the load / known / content / done protocol for every
//! connected peer.
//!
//! Each peer gets a reader task that feeds incoming messages to the node and
//! a writer task that drains the peer's three-lane outgoing queue into its
//! transport. Per-(CoValue, peer) state lives in the peer's [`PeerState`]:
//!
//! ```text
//!   idle ──load/known──▶ subscribed ──content──▶ syncing ──done──▶ synced
//! ```
//!
//! Server and storage peers are asked for everything this node loads and are
//! sent everything it creates; client peers only get what they subscribed to.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use covalence_core::{CoValueId, KnownState, NewContentPiece};
use covalence_store::Store;
use covalence_sync::{
    spawn_storage_peer, OutgoingQueue, PeerConfig, PeerId, PeerRole, PeerState, Priority,
    SyncMessage, Transport,
};

use crate::covalue_core::{CoValueState, Provenance};
use crate::covalues_store::lock;
use crate::node::{wait_resolved, LocalNode};

pub(crate) struct PeerEntry {
    pub(crate) config: PeerConfig,
    pub(crate) state: Mutex<PeerState>,
    pub(crate) outgoing: OutgoingQueue,
    transport: Arc<dyn Transport>,
    closed: watch::Sender<bool>,
}

impl PeerEntry {
    fn new(config: PeerConfig, transport: Arc<dyn Transport>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            config,
            state: Mutex::new(PeerState::new()),
            outgoing: OutgoingQueue::new(),
            transport,
            closed,
        }
    }

    pub(crate) fn id(&self) -> &PeerId {
        &self.config.id
    }

    pub(crate) fn role(&self) -> PeerRole {
        self.config.role
    }

    fn send(&self, priority: Priority, message: SyncMessage) {
        tracing::trace!(peer = %self.config.id, action = message.action(), "queueing");
        if !self.outgoing.push(priority, message) {
            tracing::trace!(peer = %self.config.id, "dropping message for closed peer");
        }
    }
}

/// Connected peers and the loads waiting on them.
#[derive(Default)]
pub(crate) struct Peers {
    entries: Mutex<HashMap<PeerId, Arc<PeerEntry>>>,
    /// Peers asked for a CoValue that have not answered yet.
    pending: Mutex<HashMap<CoValueId, HashSet<PeerId>>>,
}

impl Peers {
    pub(crate) fn get(&self, id: &PeerId) -> Option<Arc<PeerEntry>> {
        lock(&self.entries).get(id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<PeerEntry>> {
        lock(&self.entries).values().cloned().collect()
    }

    fn insert(&self, entry: Arc<PeerEntry>) -> Option<Arc<PeerEntry>> {
        lock(&self.entries).insert(entry.config.id.clone(), entry)
    }

    /// Remove `entry` unless it was already replaced by a newer connection.
    fn remove_entry(&self, entry: &Arc<PeerEntry>) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(entry.id()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(entry.id());
                true
            }
            _ => false,
        }
    }

    fn add_pending(&self, id: &CoValueId, peers: impl IntoIterator<Item = PeerId>) {
        lock(&self.pending).entry(*id).or_default().extend(peers);
    }

    /// Mark `peer` as having answered without the CoValue. Returns true when
    /// that was the last peer we were waiting on.
    fn peer_lacks(&self, id: &CoValueId, peer: &PeerId) -> bool {
        let mut pending = lock(&self.pending);
        let Some(waiting) = pending.get_mut(id) else {
            return false;
        };
        waiting.remove(peer);
        if waiting.is_empty() {
            pending.remove(id);
            true
        } else {
            false
        }
    }

    /// Drop `peer` from every pending load; returns the loads left with no
    /// one to ask.
    fn drop_peer(&self, peer: &PeerId) -> Vec<CoValueId> {
        let mut pending = lock(&self.pending);
        let mut exhausted = Vec::new();
        pending.retain(|id, waiting| {
            if waiting.remove(peer) && waiting.is_empty() {
                exhausted.push(*id);
                false
            } else {
                true
            }
        });
        exhausted
    }

    pub(crate) fn clear_pending(&self, id: &CoValueId) {
        lock(&self.pending).remove(id);
    }
}

/// Handle to a connected peer.
pub struct PeerHandle {
    id: PeerId,
    closed: watch::Receiver<bool>,
}

impl PeerHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is gone and the peer was removed.
    pub async fn closed(&mut self) {
        loop {
            if *self.closed.borrow_and_update() {
                return;
            }
            if self.closed.changed().await.is_err() {
                return;
            }
        }
    }
}

impl LocalNode {
    // ─────────────────────────────────────────────────────────────────────────
    // Peer Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start syncing with a peer over `transport`.
    ///
    /// CoValues already in memory are (re-)announced to server and storage
    /// peers, and loads that previously failed are retried.
    pub fn add_peer(&self, config: PeerConfig, transport: Arc<dyn Transport>) -> PeerHandle {
        let entry = Arc::new(PeerEntry::new(config, transport));
        let handle = PeerHandle {
            id: entry.id().clone(),
            closed: entry.closed.subscribe(),
        };
        if let Some(previous) = self.inner.peers.insert(entry.clone()) {
            tracing::info!(peer = %previous.id(), "replacing existing connection");
            previous.outgoing.close();
        }
        tracing::info!(peer = %entry.id(), role = ?entry.role(), "peer connected");

        tokio::spawn(write_loop(entry.clone()));
        let node = self.clone();
        let reader = entry.clone();
        tokio::spawn(async move { node.read_loop(reader).await });

        self.resubscribe(&entry);
        handle
    }

    /// Attach a store as a storage peer.
    pub fn add_storage(&self, store: Arc<dyn Store>) -> PeerHandle {
        let transport = spawn_storage_peer(store, self.inner.config.sync.channel_capacity);
        let id = PeerId::new(format!("storage-{}", PeerId::random()));
        self.add_peer(PeerConfig::new(id, PeerRole::Storage), Arc::new(transport))
    }

    /// Disconnect a peer.
    pub async fn remove_peer(&self, id: &PeerId) {
        if let Some(entry) = self.inner.peers.get(id) {
            entry.transport.close().await;
            self.peer_disconnected(&entry).await;
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner
            .peers
            .all()
            .iter()
            .map(|entry| entry.id().clone())
            .collect()
    }

    /// Disconnect every peer.
    pub async fn shutdown(&self) {
        for entry in self.inner.peers.all() {
            entry.transport.close().await;
            self.peer_disconnected(&entry).await;
        }
    }

    async fn read_loop(self, entry: Arc<PeerEntry>) {
        loop {
            match entry.transport.recv().await {
                Ok(Some(message)) => self.handle_message(&entry, message),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %entry.id(), error = %e, "receive failed");
                    break;
                }
            }
        }
        self.peer_disconnected(&entry).await;
    }

    async fn peer_disconnected(&self, entry: &Arc<PeerEntry>) {
        if *entry.closed.borrow() {
            return;
        }
        entry.outgoing.close();
        entry.transport.close().await;
        let removed = self.inner.peers.remove_entry(entry);
        for id in self.inner.peers.drop_peer(entry.id()) {
            if let Some(cell) = self.inner.covalues.get(&id) {
                if lock(&cell).mark_unavailable() {
                    tracing::info!(covalue = %id, "no remaining peer to load from");
                }
            }
        }
        entry.closed.send_replace(true);
        if removed {
            tracing::info!(peer = %entry.id(), "peer disconnected");
        }
    }

    fn resubscribe(&self, entry: &Arc<PeerEntry>) {
        if !entry.role().receives_all() {
            return;
        }
        for (id, cell) in self.inner.covalues.entries() {
            let (state, ours, priority) = {
                let core = lock(&cell);
                (
                    core.state(),
                    core.known_state(),
                    Priority::of_optional(core.header()),
                )
            };
            match state {
                CoValueState::Available => {
                    lock(&entry.state).subscribe(&id);
                    entry.send(priority, SyncMessage::Load(ours));
                }
                CoValueState::Loading | CoValueState::Unavailable => {
                    lock(&cell).mark_loading();
                    self.inner.peers.add_pending(&id, [entry.id().clone()]);
                    lock(&entry.state).subscribe(&id);
                    entry.send(priority, SyncMessage::Load(ours));
                }
                CoValueState::Unknown => {}
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming Messages
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_message(&self, entry: &Arc<PeerEntry>, message: SyncMessage) {
        tracing::trace!(
            peer = %entry.id(),
            action = message.action(),
            covalue = ?message.covalue_id(),
            "received"
        );
        match message {
            SyncMessage::Load(theirs) => self.handle_load(entry, theirs),
            SyncMessage::Known {
                id,
                header,
                sessions,
                is_correction,
            } => self.handle_known(
                entry,
                KnownState {
                    id,
                    header,
                    sessions,
                },
                is_correction,
            ),
            SyncMessage::Content(piece) => self.handle_content(entry, piece),
            SyncMessage::Done { id } => lock(&entry.state).synced(&id),
            SyncMessage::Ping => entry.send(Priority::High, SyncMessage::Pong),
            SyncMessage::Pong => {}
        }
    }

    fn handle_load(&self, entry: &Arc<PeerEntry>, theirs: KnownState) {
        let id = theirs.id;
        {
            let mut state = lock(&entry.state);
            state.set_known(theirs);
            state.subscribe(&id);
        }
        let cell = self.inner.covalues.get_or_create(&id);
        let (state, rx) = {
            let core = lock(&cell);
            (core.state(), core.watch_state())
        };
        match state {
            CoValueState::Available => self.answer_load(entry, &id),
            CoValueState::Unknown | CoValueState::Unavailable => {
                if self.start_load(&id, Some(entry.id()), Priority::Medium) {
                    self.answer_when_resolved(entry, id, rx);
                } else {
                    self.answer_load(entry, &id);
                }
            }
            CoValueState::Loading => self.answer_when_resolved(entry, id, rx),
        }
    }

    fn answer_when_resolved(
        &self,
        entry: &Arc<PeerEntry>,
        id: CoValueId,
        rx: watch::Receiver<CoValueState>,
    ) {
        let node = self.clone();
        let entry = entry.clone();
        let timeout = self.inner.config.load_timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, wait_resolved(rx)).await.is_err() {
                tracing::debug!(covalue = %id, peer = %entry.id(), "answering load before it resolved");
            }
            node.answer_load(&entry, &id);
        });
    }

    /// Reply to a load: our known state, whatever the peer lacks, then done.
    fn answer_load(&self, entry: &Arc<PeerEntry>, id: &CoValueId) {
        let theirs = lock(&entry.state).known_or_empty(id);
        let (ours, pieces, priority) = match self.inner.covalues.get(id) {
            Some(cell) => {
                let core = lock(&cell);
                let pieces = if core.state() == CoValueState::Available {
                    core.new_content_since(&theirs)
                } else {
                    Vec::new()
                };
                (core.known_state(), pieces, Priority::of_optional(core.header()))
            }
            None => (KnownState::empty(*id), Vec::new(), Priority::Medium),
        };
        entry.send(priority, SyncMessage::known(ours));
        self.send_pieces(entry, priority, pieces);
        entry.send(priority, SyncMessage::Done { id: *id });
    }

    fn handle_known(&self, entry: &Arc<PeerEntry>, theirs: KnownState, is_correction: bool) {
        let id = theirs.id;
        let lacks_header = !theirs.header;
        {
            let mut state = lock(&entry.state);
            if is_correction {
                tracing::debug!(peer = %entry.id(), covalue = %id, "peer asked for a resend");
                state.set_known(theirs);
            } else {
                state.record_known(&theirs);
            }
            state.subscribe(&id);
        }

        if lacks_header && self.inner.peers.peer_lacks(&id, entry.id()) {
            if let Some(cell) = self.inner.covalues.get(&id) {
                if lock(&cell).mark_unavailable() {
                    tracing::info!(covalue = %id, "no peer has this covalue");
                }
            }
        }

        let available = self
            .inner
            .covalues
            .get(&id)
            .map_or(false, |cell| lock(&cell).state() == CoValueState::Available);
        if available {
            let priority = self.push_content(entry, &id);
            entry.send(priority, SyncMessage::Done { id });
        }
    }

    fn handle_content(&self, entry: &Arc<PeerEntry>, piece: NewContentPiece) {
        let id = piece.id;
        lock(&entry.state).syncing(&id);

        let cell = self.inner.covalues.get_or_create(&id);
        let (outcome, ours, priority) = {
            let mut core = lock(&cell);
            let outcome = core.apply_piece(&piece, Provenance::Peer(entry.id().clone()));
            (
                outcome,
                core.known_state(),
                Priority::of_optional(core.header()),
            )
        };

        lock(&entry.state).record_known(&piece.known_after(&KnownState::empty(id)));

        if outcome.needs_correction() {
            tracing::warn!(peer = %entry.id(), covalue = %id, "content did not apply, requesting resend");
            entry.send(priority, SyncMessage::correction(ours));
        } else {
            // Acknowledge, so the sender sees the round as finished.
            entry.send(priority, SyncMessage::Done { id });
        }
        if outcome.header_added {
            self.inner.peers.clear_pending(&id);
        }
        if !outcome.changed() {
            return;
        }

        let deps = lock(&cell).depended_on_covalues();
        for dep in deps {
            if self.state(&dep) == CoValueState::Unknown {
                let mut candidates = self.load_candidates(None);
                if !candidates.iter().any(|c| Arc::ptr_eq(c, entry)) {
                    candidates.push(entry.clone());
                }
                self.load_from(&dep, candidates, Priority::High);
            }
        }
        for other in self.inner.peers.all() {
            if !Arc::ptr_eq(&other, entry) {
                self.sync_to_peer(&other, &id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing
    // ─────────────────────────────────────────────────────────────────────────

    /// Announce a local change to every peer.
    pub(crate) fn broadcast(&self, id: &CoValueId) {
        for entry in self.inner.peers.all() {
            self.sync_to_peer(&entry, id);
        }
    }

    /// Bring one peer up to date on `id`.
    ///
    /// Client peers that never asked about `id` are skipped; server and
    /// storage peers are asked to load it first, and the content follows
    /// their `known` reply.
    fn sync_to_peer(&self, entry: &Arc<PeerEntry>, id: &CoValueId) {
        let subscribed = lock(&entry.state).is_subscribed(id);
        if subscribed {
            self.push_content(entry, id);
            return;
        }
        if !entry.role().receives_all() {
            return;
        }
        let Some(cell) = self.inner.covalues.get(id) else {
            return;
        };
        let (ours, priority) = {
            let core = lock(&cell);
            (core.known_state(), Priority::of_optional(core.header()))
        };
        lock(&entry.state).subscribe(id);
        entry.send(priority, SyncMessage::Load(ours));
    }

    /// Send whatever the peer is not known to have. Returns the priority
    /// used for `id`.
    fn push_content(&self, entry: &Arc<PeerEntry>, id: &CoValueId) -> Priority {
        let theirs = lock(&entry.state).known_or_empty(id);
        let Some(cell) = self.inner.covalues.get(id) else {
            return Priority::Medium;
        };
        let (pieces, priority) = {
            let core = lock(&cell);
            if core.state() != CoValueState::Available {
                return Priority::of_optional(core.header());
            }
            (
                core.new_content_since(&theirs),
                Priority::of_optional(core.header()),
            )
        };
        self.send_pieces(entry, priority, pieces);
        priority
    }

    fn send_pieces(&self, entry: &Arc<PeerEntry>, priority: Priority, pieces: Vec<NewContentPiece>) {
        if pieces.is_empty() {
            return;
        }
        let id = pieces[0].id;
        {
            let mut state = lock(&entry.state);
            for piece in &pieces {
                state.record_sent(piece);
            }
            state.syncing(&id);
        }
        for piece in pieces {
            entry.send(priority, SyncMessage::Content(piece));
        }
    }

    /// Ask server and storage peers (except `exclude`) for `id`.
    ///
    /// Returns false when there is no one to ask; the core is then marked
    /// unavailable.
    pub(crate) fn start_load(
        &self,
        id: &CoValueId,
        exclude: Option<&PeerId>,
        priority: Priority,
    ) -> bool {
        let candidates = self.load_candidates(exclude);
        self.load_from(id, candidates, priority)
    }

    /// Server and storage peers, highest priority first.
    fn load_candidates(&self, exclude: Option<&PeerId>) -> Vec<Arc<PeerEntry>> {
        let mut candidates: Vec<Arc<PeerEntry>> = self
            .inner
            .peers
            .all()
            .into_iter()
            .filter(|entry| entry.role().receives_all() && Some(entry.id()) != exclude)
            .collect();
        candidates.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));
        candidates
    }

    fn load_from(
        &self,
        id: &CoValueId,
        candidates: Vec<Arc<PeerEntry>>,
        priority: Priority,
    ) -> bool {
        let cell = self.inner.covalues.get_or_create(id);
        let ours = {
            let mut core = lock(&cell);
            if core.state() == CoValueState::Available {
                return true;
            }
            if candidates.is_empty() {
                if core.mark_unavailable() {
                    tracing::debug!(covalue = %id, "no peer to load from");
                }
                return false;
            }
            core.mark_loading();
            core.known_state()
        };

        self.inner
            .peers
            .add_pending(id, candidates.iter().map(|entry| entry.id().clone()));
        for entry in &candidates {
            lock(&entry.state).subscribe(id);
            entry.send(priority, SyncMessage::Load(ours.clone()));
        }
        tracing::debug!(covalue = %id, peers = candidates.len(), "loading");
        true
    }
}

async fn write_loop(entry: Arc<PeerEntry>) {
    while let Some(message) = entry.outgoing.next().await {
        if let Err(e) = entry.transport.send(message).await {
            tracing::debug!(peer = %entry.id(), error = %e, "send failed");
            entry.outgoing.close();
            entry.transport.close().await;
            break;
        }
    }
}
