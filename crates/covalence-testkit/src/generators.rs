//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::Value;

use covalence_perms::AgentSecret;

/// A random agent.
pub fn agent() -> impl Strategy<Value = AgentSecret> {
    any::<[u8; 32]>().prop_map(|seed| AgentSecret::from_seed(&seed))
}

/// Keys from a small alphabet so edits collide often.
pub fn map_key() -> impl Strategy<Value = String> {
    prop_oneof![Just("title"), Just("body"), Just("tags")].prop_map(String::from)
}

/// JSON scalars.
pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// One map edit: clock offset, key, and value (`None` deletes).
#[derive(Debug, Clone)]
pub struct MapEdit {
    pub at: i64,
    pub key: String,
    pub value: Option<Value>,
}

pub fn map_edit() -> impl Strategy<Value = MapEdit> {
    (0i64..20, map_key(), proptest::option::weighted(0.8, scalar()))
        .prop_map(|(at, key, value)| MapEdit { at, key, value })
}

/// A sequence of edits made by one writer.
pub fn map_edits(max: usize) -> impl Strategy<Value = Vec<MapEdit>> {
    proptest::collection::vec(map_edit(), 1..=max)
}
