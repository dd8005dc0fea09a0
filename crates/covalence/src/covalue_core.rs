//! CoValueCore: the verified in-memory state of one CoValue.
//!
//! A core starts `unknown`, becomes `loading` when someone asks for it and
//! `available` once its header is known. `unavailable` is reached only from
//! `unknown` or `loading`; an available core never regresses. Session logs
//! hold every validly signed transaction. Permission checks and decryption
//! happen when content is read, against the role each author held at the
//! transaction's position.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use covalence_core::{
    decode_changes, AppendResult, CoValueHeader, CoValueId, Ed25519Signature, Keypair,
    KnownState, NewContentPiece, Op, Ruleset, SessionId, SessionLog, SessionNewContent,
    Transaction, TxPosition, ValidationError,
};
use covalence_perms::{
    AgentSecret, GroupSource, GroupState, GroupTransaction, MissingGroup, PermissionResolver,
    ReadKey,
};
use covalence_sync::PeerId;

use crate::content::{CoValueContent, ValidTransaction};
use crate::error::{NodeError, Result};

/// Lifecycle of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoValueState {
    Unknown,
    Loading,
    Available,
    Unavailable,
}

impl CoValueState {
    /// Whether a load has finished one way or the other.
    pub fn is_resolved(self) -> bool {
        matches!(self, CoValueState::Available | CoValueState::Unavailable)
    }
}

/// Where the header came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Local,
    Peer(PeerId),
}

/// Outcome of `add_transactions` for one session batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Applied { count: u32 },
    AlreadyKnown,
    InvalidSignature,
    /// The batch starts past the next expected index.
    Gap { expected: u32, got: u32 },
    /// Transactions arrived before the header.
    MissingHeader,
}

impl AddResult {
    pub fn needs_correction(self) -> bool {
        matches!(
            self,
            AddResult::InvalidSignature | AddResult::Gap { .. } | AddResult::MissingHeader
        )
    }
}

/// Outcome of applying one content piece.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceOutcome {
    pub header_added: bool,
    pub header_rejected: bool,
    pub sessions: Vec<(SessionId, AddResult)>,
}

impl PieceOutcome {
    /// Whether anything new was accepted.
    pub fn changed(&self) -> bool {
        self.header_added
            || self
                .sessions
                .iter()
                .any(|(_, result)| matches!(result, AddResult::Applied { .. }))
    }

    pub fn needs_correction(&self) -> bool {
        self.header_rejected || self.sessions.iter().any(|(_, result)| result.needs_correction())
    }
}

pub struct CoValueCore {
    id: CoValueId,
    header: Option<CoValueHeader>,
    provenance: Option<Provenance>,
    sessions: BTreeMap<SessionId, SessionLog>,
    state: watch::Sender<CoValueState>,
    changes: watch::Sender<u64>,
    /// Decoded ops by (session, idx). Failed decryptions are not cached.
    decoded: HashMap<(SessionId, u32), Arc<Vec<Op>>>,
    group: Option<Arc<GroupState>>,
    last_accessed: Instant,
}

impl CoValueCore {
    pub fn new(id: CoValueId) -> Self {
        let (state, _) = watch::channel(CoValueState::Unknown);
        let (changes, _) = watch::channel(0);
        Self {
            id,
            header: None,
            provenance: None,
            sessions: BTreeMap::new(),
            state,
            changes,
            decoded: HashMap::new(),
            group: None,
            last_accessed: Instant::now(),
        }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn header(&self) -> Option<&CoValueHeader> {
        self.header.as_ref()
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn state(&self) -> CoValueState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoValueState> {
        self.state.subscribe()
    }

    /// Change notifications: the counter increments on every accepted change.
    pub fn subscribe(&mut self) -> watch::Receiver<u64> {
        self.touch();
        self.changes.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.changes.receiver_count() > 0
    }

    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// `unknown | unavailable -> loading`.
    pub fn mark_loading(&mut self) -> bool {
        match self.state() {
            CoValueState::Unknown | CoValueState::Unavailable => {
                self.state.send_replace(CoValueState::Loading);
                true
            }
            _ => false,
        }
    }

    /// Record the header and become available.
    pub fn mark_available(
        &mut self,
        header: CoValueHeader,
        from: Provenance,
    ) -> std::result::Result<(), ValidationError> {
        if self.header.is_none() {
            if header.id() != self.id {
                return Err(ValidationError::HeaderMismatch(self.id.to_string()));
            }
            self.header = Some(header);
            self.provenance = Some(from);
            self.bump();
        }
        if self.state() != CoValueState::Available {
            self.state.send_replace(CoValueState::Available);
        }
        Ok(())
    }

    /// `unknown | loading -> unavailable`; available cores are unaffected.
    pub fn mark_unavailable(&mut self) -> bool {
        match self.state() {
            CoValueState::Unknown | CoValueState::Loading => {
                self.state.send_replace(CoValueState::Unavailable);
                true
            }
            _ => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────────

    /// Verify and append one signed session batch starting at index `after`.
    pub fn add_transactions(
        &mut self,
        session: SessionId,
        after: u32,
        transactions: &[Transaction],
        signature: &Ed25519Signature,
    ) -> AddResult {
        if self.header.is_none() {
            return AddResult::MissingHeader;
        }
        let log = self.sessions.entry(session).or_default();
        let result = match log.try_append(&self.id, &session, after, transactions, signature) {
            Ok(AppendResult::Appended { count }) => AddResult::Applied { count },
            Ok(AppendResult::AlreadyKnown) | Err(ValidationError::EmptyBatch) => {
                AddResult::AlreadyKnown
            }
            Err(ValidationError::Gap { expected, got, .. }) => {
                tracing::debug!(covalue = %self.id, %session, expected, got, "rejected batch with gap");
                AddResult::Gap { expected, got }
            }
            Err(e) => {
                tracing::warn!(covalue = %self.id, %session, error = %e, "rejected batch with invalid signature");
                AddResult::InvalidSignature
            }
        };
        if log.is_empty() {
            self.sessions.remove(&session);
        }
        if let AddResult::Applied { .. } = result {
            self.changed();
        }
        result
    }

    /// Apply a content piece received from a peer or storage.
    pub fn apply_piece(&mut self, piece: &NewContentPiece, from: Provenance) -> PieceOutcome {
        let mut outcome = PieceOutcome::default();
        if let Some(header) = &piece.header {
            if self.header.is_none() {
                match self.mark_available(header.clone(), from) {
                    Ok(()) => outcome.header_added = true,
                    Err(e) => {
                        tracing::warn!(covalue = %self.id, error = %e, "rejected header");
                        outcome.header_rejected = true;
                        return outcome;
                    }
                }
            }
        }
        for (session, content) in &piece.new {
            let result = self.add_transactions(
                *session,
                content.after,
                &content.new_transactions,
                &content.last_signature,
            );
            outcome.sessions.push((*session, result));
        }
        outcome
    }

    /// Sign and append transactions made by this node.
    pub fn append_local(
        &mut self,
        session: SessionId,
        signer: &Keypair,
        transactions: &[Transaction],
    ) -> Result<Ed25519Signature> {
        if self.header.is_none() {
            return Err(NodeError::Unavailable(self.id));
        }
        let log = self.sessions.entry(session).or_default();
        let signature = log.sign_and_append(&self.id, &session, signer, transactions)?;
        self.changed();
        Ok(signature)
    }

    /// Number of transactions known for `session` (its next index).
    pub fn session_len(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).map_or(0, SessionLog::len)
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: self.header.is_some(),
            sessions: self
                .sessions
                .iter()
                .map(|(session, log)| (*session, log.len()))
                .collect(),
        }
    }

    /// Everything beyond `known`, in pieces that each end at a signed index.
    pub fn new_content_since(&self, known: &KnownState) -> Vec<NewContentPiece> {
        let mut pieces: Vec<NewContentPiece> = Vec::new();
        for (session, log) in &self.sessions {
            let ranges = log.signed_ranges(known.count(session));
            for (n, (range, signature)) in ranges.into_iter().enumerate() {
                if pieces.len() <= n {
                    pieces.push(NewContentPiece::new(self.id));
                }
                pieces[n].new.insert(
                    *session,
                    SessionNewContent {
                        after: range.start,
                        new_transactions: log.transactions()
                            [range.start as usize..range.end as usize]
                            .to_vec(),
                        last_signature: signature,
                    },
                );
            }
        }
        if !known.header {
            if let Some(header) = &self.header {
                if pieces.is_empty() {
                    pieces.push(NewContentPiece::new(self.id));
                }
                pieces[0].header = Some(header.clone());
            }
        }
        pieces
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn changed(&mut self) {
        if self.header.as_ref().map_or(false, CoValueHeader::is_group) {
            self.group = None;
        }
        self.touch();
        self.bump();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Replayed group state, for group-ruleset values.
    pub fn group_state(&mut self) -> Option<Arc<GroupState>> {
        let initial_admin = match &self.header.as_ref()?.ruleset {
            Ruleset::Group { initial_admin } => *initial_admin,
            _ => return None,
        };
        if let Some(state) = &self.group {
            return Some(state.clone());
        }

        let mut decoded = Vec::new();
        for (session, log) in &self.sessions {
            for (idx, tx) in log.transactions().iter().enumerate() {
                if let Transaction::Trusting { made_at, changes, .. } = tx {
                    if let Some(ops) = decode_changes(changes.as_bytes()) {
                        decoded.push((TxPosition::new(*made_at, *session, idx as u32), ops));
                    }
                }
            }
        }
        let state = Arc::new(GroupState::fold(
            self.id,
            initial_admin,
            decoded.iter().map(|(position, ops)| GroupTransaction {
                position: *position,
                ops,
            }),
        ));
        self.group = Some(state.clone());
        Some(state)
    }

    /// CoValues that must be available to resolve this one's permissions or
    /// that its content points at.
    pub fn depended_on_covalues(&mut self) -> BTreeSet<CoValueId> {
        let mut deps = BTreeSet::new();
        let Some(header) = self.header.clone() else {
            return deps;
        };
        if let Some(group) = header.owner_group() {
            deps.insert(*group);
        }
        if let Some(state) = self.group_state() {
            deps.extend(state.parents().iter().copied());
        }
        for log in self.sessions.values() {
            for tx in log.transactions() {
                if let Transaction::Trusting { changes, .. } = tx {
                    for op in decode_changes(changes.as_bytes()).unwrap_or_default() {
                        deps.extend(op.referenced_covalues());
                    }
                }
            }
        }
        for ops in self.decoded.values() {
            for op in ops.iter() {
                deps.extend(op.referenced_covalues());
            }
        }
        deps.remove(&self.id);
        deps
    }

    /// Snapshot of the content as seen by `me`.
    ///
    /// Transactions whose author lacked write access at their position are
    /// dropped, as are private transactions `me` holds no key for.
    pub fn content<S: GroupSource + ?Sized>(
        &mut self,
        resolver: &PermissionResolver<'_, S>,
        me: &AgentSecret,
    ) -> Result<CoValueContent> {
        let header = self.header.clone().ok_or(NodeError::Unavailable(self.id))?;
        self.touch();
        if header.is_group() {
            let state = self.group_state().ok_or(NodeError::Unavailable(self.id))?;
            return Ok(CoValueContent::group(&state));
        }
        let owner = header.owner_group().copied();

        let mut missing = BTreeSet::new();
        let mut valid: Vec<(TxPosition, Arc<Vec<Op>>)> = Vec::new();
        let Self {
            id,
            sessions,
            decoded,
            ..
        } = self;

        for (session, log) in sessions.iter() {
            for (idx, tx) in log.transactions().iter().enumerate() {
                let idx = idx as u32;
                let position = TxPosition::new(tx.made_at(), *session, idx);
                if let Some(group) = &owner {
                    match resolver.role_at(group, session.agent(), Some(&position)) {
                        Ok(Some(role)) if role.can_write() => {}
                        Ok(_) => {
                            tracing::debug!(
                                covalue = %id,
                                %session,
                                idx,
                                "ignoring unauthorized transaction"
                            );
                            continue;
                        }
                        Err(MissingGroup(group)) => {
                            missing.insert(group);
                            continue;
                        }
                    }
                }
                if let Some(ops) = decode(id, session, idx, tx, owner.as_ref(), resolver, me, decoded) {
                    valid.push((position, ops));
                }
            }
        }

        if !missing.is_empty() {
            return Err(NodeError::MissingDependency(missing.into_iter().collect()));
        }

        valid.sort_by(|a, b| a.0.cmp(&b.0));
        let transactions: Vec<ValidTransaction<'_>> = valid
            .iter()
            .map(|(position, ops)| ValidTransaction {
                position: *position,
                ops: ops.as_slice(),
            })
            .collect();
        Ok(CoValueContent::fold(header.kind, &transactions))
    }

    /// Drop all in-memory state; durable copies are untouched.
    pub fn unmount(&mut self) {
        self.header = None;
        self.provenance = None;
        self.sessions.clear();
        self.decoded.clear();
        self.group = None;
        self.state.send_replace(CoValueState::Unknown);
        tracing::debug!(covalue = %self.id, "unmounted");
    }
}

#[allow(clippy::too_many_arguments)]
fn decode<S: GroupSource + ?Sized>(
    id: &CoValueId,
    session: &SessionId,
    idx: u32,
    tx: &Transaction,
    owner: Option<&CoValueId>,
    resolver: &PermissionResolver<'_, S>,
    me: &AgentSecret,
    cache: &mut HashMap<(SessionId, u32), Arc<Vec<Op>>>,
) -> Option<Arc<Vec<Op>>> {
    if let Some(ops) = cache.get(&(*session, idx)) {
        return Some(ops.clone());
    }
    let ops = match tx {
        Transaction::Trusting { changes, .. } => decode_changes(changes.as_bytes())?,
        Transaction::Private {
            key_used,
            encrypted_changes,
            ..
        } => {
            let group = owner?;
            let key = resolver.read_key(group, key_used, me)?;
            let nonce = ReadKey::transaction_nonce(id, session, idx);
            match key.decrypt(encrypted_changes, &nonce) {
                Ok(plaintext) => decode_changes(&plaintext)?,
                Err(e) => {
                    tracing::debug!(covalue = %id, %session, idx, error = %e, "cannot decrypt transaction");
                    return None;
                }
            }
        }
    };
    let ops = Arc::new(ops);
    cache.insert((*session, idx), ops.clone());
    Some(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalence_core::{encode_changes, CoValueType, SealerPublicKey};
    use covalence_perms::GroupAvailability;
    use proptest::prelude::*;
    use serde_json::json;

    struct NoGroups;

    impl GroupSource for NoGroups {
        fn group(&self, _id: &CoValueId) -> GroupAvailability {
            GroupAvailability::Unavailable
        }
    }

    struct Writer {
        keypair: Keypair,
        session: SessionId,
        log: SessionLog,
    }

    impl Writer {
        fn new(seed: u8) -> Self {
            let keypair = Keypair::from_seed(&[seed; 32]);
            let agent = covalence_core::AgentId::new(keypair.public_key(), SealerPublicKey([seed; 32]));
            Self {
                keypair,
                session: SessionId::from_parts(agent, [seed; 8]),
                log: SessionLog::new(),
            }
        }

        /// Sign a batch of map sets, returning (after, txs, signature).
        fn batch(&mut self, id: &CoValueId, sets: &[(i64, &str, &str)]) -> (u32, Vec<Transaction>, Ed25519Signature) {
            let after = self.log.len();
            let txs: Vec<Transaction> = sets
                .iter()
                .map(|(made_at, key, value)| Transaction::Trusting {
                    made_at: *made_at,
                    changes: encode_changes(&[Op::Set {
                        key: (*key).into(),
                        value: json!(value),
                    }])
                    .unwrap(),
                    meta: None,
                })
                .collect();
            let signature = self
                .log
                .sign_and_append(id, &self.session, &self.keypair, &txs)
                .unwrap();
            (after, txs, signature)
        }
    }

    fn map_core() -> CoValueCore {
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll)
            .with_uniqueness([1; 12]);
        let mut core = CoValueCore::new(header.id());
        core.mark_available(header, Provenance::Local).unwrap();
        core
    }

    fn snapshot(core: &mut CoValueCore) -> Vec<u8> {
        let me = AgentSecret::from_seed(&[0; 32]);
        core.content(&PermissionResolver::new(&NoGroups), &me)
            .unwrap()
            .to_canonical_json()
            .unwrap()
    }

    #[test]
    fn test_state_never_regresses() {
        let mut core = map_core();
        assert_eq!(core.state(), CoValueState::Available);
        assert!(!core.mark_unavailable());
        assert!(!core.mark_loading());
        assert_eq!(core.state(), CoValueState::Available);

        let mut other = CoValueCore::new(CoValueId::derive(b"x"));
        assert!(other.mark_loading());
        assert!(other.mark_unavailable());
        // Explicit re-subscription may retry.
        assert!(other.mark_loading());
    }

    #[test]
    fn test_header_must_match_id() {
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll);
        let mut core = CoValueCore::new(CoValueId::derive(b"other"));
        assert!(core.mark_available(header, Provenance::Local).is_err());
        assert_eq!(core.state(), CoValueState::Unknown);
    }

    #[test]
    fn test_idempotent_application() {
        let mut core = map_core();
        let id = *core.id();
        let mut writer = Writer::new(2);
        let (after, txs, sig) = writer.batch(&id, &[(1, "a", "x"), (2, "b", "y")]);

        assert_eq!(
            core.add_transactions(writer.session, after, &txs, &sig),
            AddResult::Applied { count: 2 }
        );
        let first = snapshot(&mut core);
        assert_eq!(
            core.add_transactions(writer.session, after, &txs, &sig),
            AddResult::AlreadyKnown
        );
        assert_eq!(snapshot(&mut core), first);
    }

    #[test]
    fn test_gap_is_rejected_not_skipped() {
        let mut core = map_core();
        let id = *core.id();
        let mut writer = Writer::new(3);
        let (a0, t0, s0) = writer.batch(&id, &[(1, "a", "0")]);
        let (a1, t1, s1) = writer.batch(&id, &[(2, "a", "1")]);
        let (a2, t2, s2) = writer.batch(&id, &[(3, "a", "2")]);

        assert_eq!(core.add_transactions(writer.session, a0, &t0, &s0), AddResult::Applied { count: 1 });
        assert_eq!(
            core.add_transactions(writer.session, a2, &t2, &s2),
            AddResult::Gap { expected: 1, got: 2 }
        );
        assert_eq!(core.session_len(&writer.session), 1);
        assert_eq!(core.add_transactions(writer.session, a1, &t1, &s1), AddResult::Applied { count: 1 });
        assert_eq!(core.add_transactions(writer.session, a2, &t2, &s2), AddResult::Applied { count: 1 });
        assert_eq!(core.session_len(&writer.session), 3);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let mut core = map_core();
        let id = *core.id();
        let mut writer = Writer::new(4);
        let (after, mut txs, sig) = writer.batch(&id, &[(1, "title", "draft")]);
        if let Transaction::Trusting { changes, .. } = &mut txs[0] {
            *changes = changes.replace("draft", "dRaft");
        }
        assert_eq!(
            core.add_transactions(writer.session, after, &txs, &sig),
            AddResult::InvalidSignature
        );
        assert_eq!(core.known_state().sessions.len(), 0);
    }

    #[test]
    fn test_missing_header() {
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll);
        let id = header.id();
        let mut core = CoValueCore::new(id);
        let mut writer = Writer::new(5);
        let (after, txs, sig) = writer.batch(&id, &[(1, "a", "b")]);
        assert_eq!(
            core.add_transactions(writer.session, after, &txs, &sig),
            AddResult::MissingHeader
        );
    }

    #[test]
    fn test_new_content_since_round_trip() {
        let mut source = map_core();
        let id = *source.id();
        let mut writer = Writer::new(6);
        for n in 0..3 {
            let (after, txs, sig) = writer.batch(&id, &[(n, "k", "v")]);
            source.add_transactions(writer.session, after, &txs, &sig);
        }

        let mut target = CoValueCore::new(id);
        let pieces = source.new_content_since(&KnownState::empty(id));
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].header.is_some());
        let outcome = target.apply_piece(&pieces[0], Provenance::Peer(PeerId::new("a")));
        assert!(outcome.header_added && outcome.changed() && !outcome.needs_correction());
        assert_eq!(target.known_state(), source.known_state());
        assert!(source.new_content_since(&target.known_state()).is_empty());

        // Partial knowledge only ships the suffix, without the header.
        let mut partial = KnownState::empty(id);
        partial.header = true;
        partial.sessions.insert(writer.session, 2);
        let suffix = source.new_content_since(&partial);
        assert!(suffix[0].header.is_none());
        assert_eq!(suffix[0].new[&writer.session].after, 2);
        assert_eq!(suffix[0].new[&writer.session].new_transactions.len(), 1);
    }

    #[test]
    fn test_unmount_drops_state() {
        let mut core = map_core();
        let id = *core.id();
        let mut writer = Writer::new(7);
        let (after, txs, sig) = writer.batch(&id, &[(1, "a", "b")]);
        core.add_transactions(writer.session, after, &txs, &sig);
        core.unmount();
        assert_eq!(core.state(), CoValueState::Unknown);
        assert!(core.header().is_none());
        assert_eq!(core.known_state(), KnownState::empty(id));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sessions_commute(
            a in proptest::collection::vec((0i64..5, 0usize..3), 1..5),
            b in proptest::collection::vec((0i64..5, 0usize..3), 1..5),
        ) {
            let keys = ["x", "y", "z"];
            let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll)
                .with_uniqueness([9; 12]);
            let id = header.id();

            let mut wa = Writer::new(10);
            let mut wb = Writer::new(11);
            let sets_a: Vec<(i64, &str, &str)> = a.iter().map(|(t, k)| (*t, keys[*k], "from-a")).collect();
            let sets_b: Vec<(i64, &str, &str)> = b.iter().map(|(t, k)| (*t, keys[*k], "from-b")).collect();
            let batch_a = wa.batch(&id, &sets_a);
            let batch_b = wb.batch(&id, &sets_b);

            let mut ab = CoValueCore::new(id);
            ab.mark_available(header.clone(), Provenance::Local).unwrap();
            ab.add_transactions(wa.session, batch_a.0, &batch_a.1, &batch_a.2);
            ab.add_transactions(wb.session, batch_b.0, &batch_b.1, &batch_b.2);

            let mut ba = CoValueCore::new(id);
            ba.mark_available(header, Provenance::Local).unwrap();
            ba.add_transactions(wb.session, batch_b.0, &batch_b.1, &batch_b.2);
            ba.add_transactions(wa.session, batch_a.0, &batch_a.1, &batch_a.2);

            prop_assert_eq!(snapshot(&mut ab), snapshot(&mut ba));
        }

        #[test]
        fn prop_any_flipped_byte_fails_verification(position in 0usize..64, bit in 0u8..8) {
            let mut core = map_core();
            let id = *core.id();
            let mut writer = Writer::new(12);
            let (after, mut txs, sig) = writer.batch(&id, &[(1, "title", "a fairly long draft value")]);
            if let Transaction::Trusting { changes, .. } = &mut txs[0] {
                let mut bytes = changes.clone().into_bytes();
                let at = position % bytes.len();
                bytes[at] ^= 1 << bit;
                *changes = String::from_utf8_lossy(&bytes).into_owned();
            }
            prop_assert_eq!(
                core.add_transactions(writer.session, after, &txs, &sig),
                AddResult::InvalidSignature
            );
        }
    }
}
