//! Serde helpers that encode fixed-size byte arrays as lowercase hex strings.

use serde::{de, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
    let s = String::deserialize(d)?;
    let bytes = hex::decode(&s).map_err(de::Error::custom)?;
    bytes
        .try_into()
        .map_err(|_| de::Error::custom(format!("expected {} hex-encoded bytes", N)))
}

/// Variable-length variant for `Vec<u8>` fields.
pub mod vec {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(de::Error::custom)
    }
}
