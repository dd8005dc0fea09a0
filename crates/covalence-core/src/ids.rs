//! Identifiers: CoValues, agents, sessions, keys and group members.
//!
//! Every identifier has a stable textual form that doubles as its serde
//! representation, so they can be used as JSON object keys on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::{Ed25519PublicKey, SealerPublicKey};
use crate::error::CoreError;

fn parse_hex<const N: usize>(s: &str, what: &str) -> Result<[u8; N], CoreError> {
    let bytes = hex::decode(s).map_err(|_| CoreError::InvalidId(format!("{}: bad hex", what)))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::InvalidId(format!("{}: expected {} bytes", what, N)))
}

/// Content-derived identifier of a CoValue: hash of its header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoValueId(pub [u8; 32]);

impl CoValueId {
    const PREFIX: &'static str = "co_";

    /// Derive an ID from canonical header bytes.
    pub fn derive(canonical_header: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"covalence-header-v0:");
        hasher.update(canonical_header);
        Self(*hasher.finalize().as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoValueId({})", &hex::encode(self.0)[..16])
    }
}

impl FromStr for CoValueId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::InvalidId(format!("not a CoValue id: {}", s)))?;
        Ok(Self(parse_hex(hex, "CoValue id")?))
    }
}

/// A signing + sealing identity. Members of groups are agents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    pub signer: Ed25519PublicKey,
    pub sealer: SealerPublicKey,
}

impl AgentId {
    const PREFIX: &'static str = "agent_";

    pub fn new(signer: Ed25519PublicKey, sealer: SealerPublicKey) -> Self {
        Self { signer, sealer }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}_{}",
            Self::PREFIX,
            self.signer.to_hex(),
            self.sealer.to_hex()
        )
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &self.signer.to_hex()[..16])
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::InvalidId(format!("not an agent id: {}", s)))?;
        let (signer, sealer) = rest
            .split_once('_')
            .ok_or_else(|| CoreError::InvalidId(format!("malformed agent id: {}", s)))?;
        Ok(Self {
            signer: Ed25519PublicKey(parse_hex(signer, "agent signer")?),
            sealer: SealerPublicKey(parse_hex(sealer, "agent sealer")?),
        })
    }
}

/// One writer device's append-only log within a CoValue.
///
/// The agent is embedded so the signer key can be recovered from the id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId {
    agent: AgentId,
    nonce: [u8; 8],
}

impl SessionId {
    const SEPARATOR: &'static str = "_session_";

    /// A fresh session for the given agent.
    pub fn new_random(agent: AgentId) -> Self {
        Self {
            agent,
            nonce: rand::random(),
        }
    }

    pub fn from_parts(agent: AgentId, nonce: [u8; 8]) -> Self {
        Self { agent, nonce }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.agent, Self::SEPARATOR, hex::encode(self.nonce))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionId({}/{})",
            &self.agent.signer.to_hex()[..8],
            hex::encode(self.nonce)
        )
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, nonce) = s
            .rsplit_once(Self::SEPARATOR)
            .ok_or_else(|| CoreError::InvalidId(format!("not a session id: {}", s)))?;
        Ok(Self {
            agent: agent.parse()?,
            nonce: parse_hex(nonce, "session nonce")?,
        })
    }
}

/// Identifier of a symmetric read or write key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(pub [u8; 8]);

impl KeyId {
    const PREFIX: &'static str = "key_";

    /// Key ids are derived from the key material.
    pub fn derive(key_material: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"covalence-key-id-v0:");
        hasher.update(key_material);
        let mut id = [0u8; 8];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
        Self(id)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::InvalidId(format!("not a key id: {}", s)))?;
        Ok(Self(parse_hex(hex, "key id")?))
    }
}

/// A role holder inside a group: a specific agent or everyone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemberId {
    Everyone,
    Agent(AgentId),
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberId::Everyone => f.write_str("everyone"),
            MemberId::Agent(agent) => agent.fmt(f),
        }
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberId::Everyone => f.write_str("Everyone"),
            MemberId::Agent(agent) => agent.fmt(f),
        }
    }
}

impl FromStr for MemberId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "everyone" {
            Ok(MemberId::Everyone)
        } else {
            Ok(MemberId::Agent(s.parse()?))
        }
    }
}

impl From<AgentId> for MemberId {
    fn from(agent: AgentId) -> Self {
        MemberId::Agent(agent)
    }
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = CoreError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> String {
                value.to_string()
            }
        }
    )*};
}

string_conversions!(CoValueId, AgentId, SessionId, KeyId, MemberId);
