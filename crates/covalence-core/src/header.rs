//! CoValue headers.
//!
//! A header is immutable metadata: content type, ruleset, optional meta and
//! creation randomness. The CoValue ID is the hash of its canonical encoding.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_header_bytes;
use crate::ids::{AgentId, CoValueId};
use crate::serde_hex;

/// Content type of a CoValue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    CoMap,
    CoList,
    CoStream,
    CoPlainText,
    CoRichText,
}

/// Who may write, and how readers obtain keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// The value is itself an access-control list.
    #[serde(rename_all = "camelCase")]
    Group { initial_admin: AgentId },
    /// Permissions are inherited from a group.
    OwnedByGroup { group: CoValueId },
    /// Anyone may write; nothing is encrypted.
    UnsafeAllowAll,
}

/// Optional classification metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HeaderMeta {
    Account,
    #[serde(rename_all = "camelCase")]
    Binary {
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub kind: CoValueType,
    pub ruleset: Ruleset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<HeaderMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(with = "serde_hex")]
    pub uniqueness: [u8; 12],
}

impl CoValueHeader {
    /// A new header with fresh uniqueness.
    pub fn new(kind: CoValueType, ruleset: Ruleset) -> Self {
        Self {
            kind,
            ruleset,
            meta: None,
            created_at: None,
            uniqueness: rand::random(),
        }
    }

    pub fn with_meta(mut self, meta: HeaderMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn created_at(mut self, millis: i64) -> Self {
        self.created_at = Some(millis);
        self
    }

    /// Replace the random uniqueness (for deterministic ids in tests and fixtures).
    pub fn with_uniqueness(mut self, uniqueness: [u8; 12]) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    /// The content-derived ID.
    pub fn id(&self) -> CoValueId {
        CoValueId::derive(&canonical_header_bytes(self))
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    pub fn is_account(&self) -> bool {
        matches!(self.meta, Some(HeaderMeta::Account))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.meta, Some(HeaderMeta::Binary { .. }))
    }

    /// The group whose membership governs this value, if any.
    pub fn owner_group(&self) -> Option<&CoValueId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519PublicKey, SealerPublicKey};

    fn admin() -> AgentId {
        AgentId::new(Ed25519PublicKey([1; 32]), SealerPublicKey([2; 32]))
    }

    #[test]
    fn test_id_is_deterministic() {
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll)
            .with_uniqueness([4; 12])
            .created_at(1_000);
        let again = header.clone();
        assert_eq!(header.id(), again.id());

        let other = header.clone().with_uniqueness([5; 12]);
        assert_ne!(header.id(), other.id());
    }

    #[test]
    fn test_json_shape() {
        let header = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group {
                initial_admin: admin(),
            },
        )
        .with_meta(HeaderMeta::Account);
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["type"], "comap");
        assert_eq!(json["ruleset"]["type"], "group");
        assert!(json["ruleset"]["initialAdmin"].is_string());
        assert_eq!(json["meta"]["type"], "account");

        let back: CoValueHeader = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), header.id());
    }

    #[test]
    fn test_owner_group() {
        let group = CoValueId::derive(b"group");
        let header = CoValueHeader::new(
            CoValueType::CoList,
            Ruleset::OwnedByGroup { group },
        );
        assert_eq!(header.owner_group(), Some(&group));
        assert!(!header.is_group());
    }
}
