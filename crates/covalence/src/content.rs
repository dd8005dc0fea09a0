//! Snapshots of CoValue content.
//!
//! Every snapshot is a pure fold over the valid transactions of a CoValue in
//! `(madeAt, sessionID, idx)` order, so any replica holding the same
//! transactions computes the same value. Snapshots serialize to canonical
//! JSON (sorted keys) for byte-level comparison.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use covalence_core::{CoValueId, CoValueType, KeyId, MemberId, Op, OpId, Role, SessionId, TxPosition};
use covalence_perms::GroupState;

/// One transaction that passed signature, permission and decryption checks.
#[derive(Debug, Clone)]
pub(crate) struct ValidTransaction<'a> {
    pub position: TxPosition,
    pub ops: &'a [Op],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoValueContent {
    CoMap(CoMapContent),
    CoList(CoListContent),
    CoStream(CoStreamContent),
    CoPlainText(TextContent),
    CoRichText(TextContent),
    Group(GroupContent),
}

impl CoValueContent {
    /// Fold valid transactions (already sorted) into a snapshot.
    pub(crate) fn fold(kind: CoValueType, transactions: &[ValidTransaction<'_>]) -> Self {
        match kind {
            CoValueType::CoMap => CoValueContent::CoMap(CoMapContent::fold(transactions)),
            CoValueType::CoList => CoValueContent::CoList(CoListContent::fold(transactions)),
            CoValueType::CoStream => CoValueContent::CoStream(CoStreamContent::fold(transactions)),
            CoValueType::CoPlainText => CoValueContent::CoPlainText(TextContent::fold(transactions)),
            CoValueType::CoRichText => CoValueContent::CoRichText(TextContent::fold(transactions)),
        }
    }

    pub(crate) fn group(state: &GroupState) -> Self {
        CoValueContent::Group(GroupContent {
            members: state.members(),
            read_key: state.current_read_key(),
            parents: state.parents().clone(),
            fields: state.fields().clone(),
        })
    }

    /// Deterministic JSON encoding.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn as_map(&self) -> Option<&CoMapContent> {
        match self {
            CoValueContent::CoMap(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoListContent> {
        match self {
            CoValueContent::CoList(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStreamContent> {
        match self {
            CoValueContent::CoStream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextContent> {
        match self {
            CoValueContent::CoPlainText(text) | CoValueContent::CoRichText(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupContent> {
        match self {
            CoValueContent::Group(group) => Some(group),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CoMap
// ─────────────────────────────────────────────────────────────────────────────

/// Last-writer-wins map.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoMapContent {
    entries: BTreeMap<String, Value>,
}

impl CoMapContent {
    fn fold(transactions: &[ValidTransaction<'_>]) -> Self {
        let mut entries = BTreeMap::new();
        for tx in transactions {
            for op in tx.ops {
                match op {
                    Op::Set { key, value } => {
                        entries.insert(key.clone(), value.clone());
                    }
                    Op::Del { key } => {
                        entries.remove(key);
                    }
                    _ => {}
                }
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CoList / text
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered sequence built from insert-after operations.
///
/// Siblings inserted after the same anchor are ordered newest first, and an
/// anchor that never arrived places its inserts at the start. Removes are
/// tombstones, so a remove ordered before its insert still hides it.
fn fold_sequence(transactions: &[ValidTransaction<'_>]) -> Vec<(OpId, Value)> {
    let mut values: HashMap<OpId, Value> = HashMap::new();
    let mut inserts: Vec<(OpId, Option<OpId>)> = Vec::new();
    let mut removed: HashSet<OpId> = HashSet::new();

    for tx in transactions {
        for (change, op) in tx.ops.iter().enumerate() {
            let id = OpId {
                session: tx.position.session,
                tx: tx.position.idx,
                change: change as u32,
            };
            match op {
                Op::Insert { after, value } => {
                    values.insert(id, value.clone());
                    inserts.push((id, *after));
                }
                Op::Remove { target } => {
                    removed.insert(*target);
                }
                _ => {}
            }
        }
    }

    let mut children: HashMap<Option<OpId>, Vec<OpId>> = HashMap::new();
    for (id, after) in inserts {
        let anchor = after.filter(|a| values.contains_key(a));
        children.entry(anchor).or_default().push(id);
    }

    let mut out = Vec::with_capacity(values.len());
    let mut stack: Vec<OpId> = children.get(&None).cloned().unwrap_or_default();
    while let Some(id) = stack.pop() {
        if !removed.contains(&id) {
            if let Some(value) = values.get(&id) {
                out.push((id, value.clone()));
            }
        }
        if let Some(kids) = children.get(&Some(id)) {
            stack.extend(kids.iter().copied());
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoListContent {
    items: Vec<Value>,
    #[serde(skip)]
    ids: Vec<OpId>,
}

impl CoListContent {
    fn fold(transactions: &[ValidTransaction<'_>]) -> Self {
        let (ids, items) = fold_sequence(transactions).into_iter().unzip();
        Self { items, ids }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Address of the item at `index`, used as an insert anchor.
    pub fn id_at(&self, index: usize) -> Option<OpId> {
        self.ids.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Plain or rich text: a sequence of inserted units (characters when written
/// through the node API).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TextContent {
    text: String,
    #[serde(skip)]
    ids: Vec<OpId>,
}

impl TextContent {
    fn fold(transactions: &[ValidTransaction<'_>]) -> Self {
        let mut text = String::new();
        let mut ids = Vec::new();
        for (id, value) in fold_sequence(transactions) {
            if let Some(unit) = value.as_str() {
                text.push_str(unit);
                ids.push(id);
            }
        }
        Self { text, ids }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn id_at(&self, index: usize) -> Option<OpId> {
        self.ids.get(index).copied()
    }

    /// Number of inserted units.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CoStream
// ─────────────────────────────────────────────────────────────────────────────

/// Append-only items, kept per writing session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoStreamContent {
    sessions: BTreeMap<SessionId, Vec<Value>>,
    #[serde(skip)]
    ordered: Vec<Value>,
}

impl CoStreamContent {
    fn fold(transactions: &[ValidTransaction<'_>]) -> Self {
        let mut sessions: BTreeMap<SessionId, Vec<Value>> = BTreeMap::new();
        let mut ordered = Vec::new();
        for tx in transactions {
            for op in tx.ops {
                if let Op::Append { item } = op {
                    sessions
                        .entry(tx.position.session)
                        .or_default()
                        .push(item.clone());
                    ordered.push(item.clone());
                }
            }
        }
        Self { sessions, ordered }
    }

    pub fn by_session(&self) -> &BTreeMap<SessionId, Vec<Value>> {
        &self.sessions
    }

    /// Every item in merge order.
    pub fn items(&self) -> &[Value] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Group
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContent {
    pub members: BTreeMap<MemberId, Role>,
    pub read_key: Option<KeyId>,
    pub parents: BTreeSet<CoValueId>,
    pub fields: BTreeMap<String, Value>,
}

impl GroupContent {
    pub fn role_of(&self, member: &MemberId) -> Option<Role> {
        self.members.get(member).copied()
    }
}
