//! Tagged change operations carried inside transactions.
//!
//! Changes are encoded as a JSON array of objects discriminated by `op`.
//! Decoding fails closed: unknown `op` tags become [`Op::Unknown`] and are
//! ignored by every fold, and a change list that does not parse at all yields
//! `None` so the whole transaction contributes nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::ids::{AgentId, CoValueId, KeyId, MemberId, SessionId};
use crate::serde_hex;

/// Role of a member inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Reader,
    Writer,
    Admin,
    WriteOnly,
    Revoked,
}

impl Role {
    pub fn can_read(self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::Admin)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Role::Writer | Role::Admin | Role::WriteOnly)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Address of a single change: (session, transaction index, change index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub session: SessionId,
    pub tx: u32,
    pub change: u32,
}

/// Position of a transaction in the total order every fold uses:
/// `madeAt`, then session ID, then index within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxPosition {
    pub made_at: i64,
    pub session: SessionId,
    pub idx: u32,
}

impl TxPosition {
    pub fn new(made_at: i64, session: SessionId, idx: u32) -> Self {
        Self {
            made_at,
            session,
            idx,
        }
    }
}

/// A read key sealed to one agent's sealer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    #[serde(with = "serde_hex")]
    pub ephemeral: [u8; 32],
    #[serde(with = "serde_hex")]
    pub nonce: [u8; 12],
    #[serde(with = "serde_hex::vec")]
    pub ciphertext: Vec<u8>,
}

/// A key encrypted under another symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKey {
    #[serde(with = "serde_hex")]
    pub nonce: [u8; 12],
    #[serde(with = "serde_hex::vec")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Op {
    // CoMap
    #[serde(rename = "set")]
    Set { key: String, value: Value },
    #[serde(rename = "del")]
    Del { key: String },

    // CoList / text
    #[serde(rename = "ins")]
    Insert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<OpId>,
        value: Value,
    },
    #[serde(rename = "rem")]
    Remove { target: OpId },

    // CoStream
    #[serde(rename = "app")]
    Append { item: Value },

    // Group
    #[serde(rename = "role")]
    SetRole { member: MemberId, role: Role },
    #[serde(rename = "reveal")]
    RevealKey {
        key: KeyId,
        to: AgentId,
        sealed: SealedKey,
    },
    #[serde(rename = "revealEveryone")]
    RevealKeyToEveryone {
        key: KeyId,
        #[serde(with = "serde_hex")]
        secret: [u8; 32],
    },
    #[serde(rename = "readKey")]
    SetReadKey { key: KeyId },
    #[serde(rename = "keyForKey", rename_all = "camelCase")]
    KeyForKey {
        key: KeyId,
        encrypting_key: KeyId,
        encrypted: EncryptedKey,
    },
    #[serde(rename = "writeKey")]
    SetWriteKey { member: AgentId, key: KeyId },
    #[serde(rename = "extend")]
    Extend { parent: CoValueId },

    #[serde(other)]
    Unknown,
}

impl Op {
    /// Whether this op only makes sense inside a group.
    pub fn is_group_op(&self) -> bool {
        matches!(
            self,
            Op::SetRole { .. }
                | Op::RevealKey { .. }
                | Op::RevealKeyToEveryone { .. }
                | Op::SetReadKey { .. }
                | Op::KeyForKey { .. }
                | Op::SetWriteKey { .. }
                | Op::Extend { .. }
        )
    }

    /// CoValues this op points at (group extension or `co_` string values).
    pub fn referenced_covalues(&self) -> Vec<CoValueId> {
        match self {
            Op::Extend { parent } => vec![*parent],
            Op::Set { value, .. } | Op::Insert { value, .. } | Op::Append { item: value } => {
                value_reference(value).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }
}

fn value_reference(value: &Value) -> Option<CoValueId> {
    value.as_str().and_then(|s| s.parse().ok())
}

/// Encode an op list as the JSON text stored in a transaction.
pub fn encode_changes(ops: &[Op]) -> Result<String, CoreError> {
    serde_json::to_string(ops).map_err(|e| CoreError::Encoding(e.to_string()))
}

/// Decode a change list; `None` when it is not a well-formed op array.
pub fn decode_changes(json: &[u8]) -> Option<Vec<Op>> {
    serde_json::from_slice(json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_op_is_ignored_not_fatal() {
        let ops = decode_changes(br#"[{"op":"set","key":"a","value":1},{"op":"teleport","x":1}]"#)
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], Op::Set { .. }));
        assert_eq!(ops[1], Op::Unknown);
    }

    #[test]
    fn test_malformed_change_list_fails_closed() {
        assert!(decode_changes(b"not json").is_none());
        assert!(decode_changes(br#"{"op":"set"}"#).is_none());
        assert!(decode_changes(br#"[{"op":"set","key":5}]"#).is_none());
    }

    #[test]
    fn test_references() {
        let target = CoValueId::derive(b"profile");
        let op = Op::Set {
            key: "profile".into(),
            value: json!(target.to_string()),
        };
        assert_eq!(op.referenced_covalues(), vec![target]);

        let plain = Op::Set {
            key: "title".into(),
            value: json!("draft"),
        };
        assert!(plain.referenced_covalues().is_empty());
        assert_eq!(
            Op::Extend { parent: target }.referenced_covalues(),
            vec![target]
        );
    }

    #[test]
    fn test_role_capabilities() {
        assert!(Role::Admin.can_read() && Role::Admin.can_write() && Role::Admin.is_admin());
        assert!(Role::Writer.can_write() && !Role::Writer.is_admin());
        assert!(Role::Reader.can_read() && !Role::Reader.can_write());
        assert!(Role::WriteOnly.can_write() && !Role::WriteOnly.can_read());
        assert!(!Role::Revoked.can_read() && !Role::Revoked.can_write());
        assert_eq!(serde_json::to_value(Role::WriteOnly).unwrap(), json!("writeOnly"));
    }
}
