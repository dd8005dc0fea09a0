//! Cryptographic utilities for the permissions module.
//!
//! Provides X25519 sealing of read keys to members and ChaCha20-Poly1305
//! encryption of private transactions and of keys under other keys.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use covalence_core::{
    AgentId, CoValueId, EncryptedKey, KeyId, Keypair, SealedKey, SealerPublicKey, SessionId,
};

use crate::error::{PermsError, Result};

/// An X25519 static secret used to open sealed read keys.
#[derive(Clone)]
pub struct SealerSecret([u8; 32]);

impl SealerSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn public_key(&self) -> SealerPublicKey {
        SealerPublicKey(*PublicKey::from(&StaticSecret::from(self.0)).as_bytes())
    }

    /// Open a key sealed to this secret's public key.
    pub fn unseal(&self, sealed: &SealedKey, context: &[u8]) -> Result<ReadKey> {
        let shared = StaticSecret::from(self.0).diffie_hellman(&PublicKey::from(sealed.ephemeral));
        let cipher = sealing_cipher(shared.as_bytes(), context)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|e| PermsError::DecryptionError(e.to_string()))?;
        let bytes: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| PermsError::DecryptionError("sealed key is not 32 bytes".into()))?;
        Ok(ReadKey(bytes))
    }
}

impl fmt::Debug for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SealerSecret").field(&self.public_key()).finish()
    }
}

fn sealing_cipher(shared: &[u8; 32], context: &[u8]) -> Result<ChaCha20Poly1305> {
    let mut hasher = blake3::Hasher::new_derive_key("covalence-perms-v0 sealing");
    hasher.update(shared);
    hasher.update(context);
    ChaCha20Poly1305::new_from_slice(hasher.finalize().as_bytes())
        .map_err(|e| PermsError::EncryptionError(e.to_string()))
}

/// Context binding a sealed key to its group and key id.
pub fn seal_context(group: &CoValueId, key: &KeyId) -> Vec<u8> {
    let mut context = Vec::with_capacity(40);
    context.extend_from_slice(group.as_bytes());
    context.extend_from_slice(&key.0);
    context
}

/// Seal a read key to a recipient using an ephemeral X25519 key.
pub fn seal_key(key: &ReadKey, recipient: &SealerPublicKey, context: &[u8]) -> Result<SealedKey> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.0));
    let cipher = sealing_cipher(shared.as_bytes(), context)?;

    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), key.0.as_slice())
        .map_err(|e| PermsError::EncryptionError(e.to_string()))?;

    Ok(SealedKey {
        ephemeral: *ephemeral_public.as_bytes(),
        nonce,
        ciphertext,
    })
}

/// A symmetric key encrypting private transactions of a group's values.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadKey([u8; 32]);

impl ReadKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn id(&self) -> KeyId {
        KeyId::derive(&self.0)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| PermsError::EncryptionError(e.to_string()))
    }

    /// Nonce for transaction `idx` of `session` in `covalue`.
    ///
    /// Every (CoValue, session, index) triple is written once, so derived
    /// nonces never repeat under one key.
    pub fn transaction_nonce(covalue: &CoValueId, session: &SessionId, idx: u32) -> [u8; 12] {
        let mut hasher = blake3::Hasher::new_derive_key("covalence-perms-v0 tx-nonce");
        hasher.update(covalue.as_bytes());
        hasher.update(session.to_string().as_bytes());
        hasher.update(&idx.to_le_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..12]);
        nonce
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>> {
        self.cipher()?
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| PermsError::EncryptionError(e.to_string()))
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>> {
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| PermsError::DecryptionError(e.to_string()))
    }

    /// Encrypt another key under this one.
    pub fn wrap(&self, other: &ReadKey) -> Result<EncryptedKey> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        Ok(EncryptedKey {
            nonce,
            ciphertext: self.encrypt(&other.0, &nonce)?,
        })
    }

    /// Decrypt a key wrapped under this one and check it against `expected`.
    pub fn unwrap_key(&self, wrapped: &EncryptedKey, expected: &KeyId) -> Result<ReadKey> {
        let plaintext = self.decrypt(&wrapped.ciphertext, &wrapped.nonce)?;
        let bytes: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| PermsError::DecryptionError("wrapped key is not 32 bytes".into()))?;
        let key = ReadKey(bytes);
        if &key.id() != expected {
            return Err(PermsError::KeyMismatch {
                expected: expected.to_string(),
            });
        }
        Ok(key)
    }
}

impl fmt::Debug for ReadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadKey({})", self.id())
    }
}

/// Signing and sealing secrets of one agent.
#[derive(Clone)]
pub struct AgentSecret {
    signer: Keypair,
    sealer: SealerSecret,
}

impl AgentSecret {
    pub fn generate() -> Self {
        Self {
            signer: Keypair::generate(),
            sealer: SealerSecret::generate(),
        }
    }

    /// Derive both secrets from one seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signer_seed = blake3::derive_key("covalence-perms-v0 agent signer", seed);
        let sealer_seed = blake3::derive_key("covalence-perms-v0 agent sealer", seed);
        Self {
            signer: Keypair::from_seed(&signer_seed),
            sealer: SealerSecret::from_bytes(sealer_seed),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId::new(self.signer.public_key(), self.sealer.public_key())
    }

    pub fn signer(&self) -> &Keypair {
        &self.signer
    }

    pub fn sealer(&self) -> &SealerSecret {
        &self.sealer
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSecret")
            .field("agent", &self.agent_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seal_unseal() {
        let alice = AgentSecret::generate();
        let key = ReadKey::generate();
        let group = CoValueId::derive(b"group");
        let context = seal_context(&group, &key.id());

        let sealed = seal_key(&key, &alice.agent_id().sealer, &context).unwrap();
        assert_eq!(alice.sealer().unseal(&sealed, &context).unwrap(), key);

        let mallory = AgentSecret::generate();
        assert!(mallory.sealer().unseal(&sealed, &context).is_err());

        let other_context = seal_context(&CoValueId::derive(b"other"), &key.id());
        assert!(alice.sealer().unseal(&sealed, &other_context).is_err());
    }

    #[test]
    fn test_transaction_encryption() {
        let key = ReadKey::generate();
        let session = SessionId::new_random(AgentSecret::generate().agent_id());
        let id = CoValueId::derive(b"map");
        let nonce = ReadKey::transaction_nonce(&id, &session, 3);
        assert_ne!(nonce, ReadKey::transaction_nonce(&id, &session, 4));

        let ciphertext = key.encrypt(b"[]", &nonce).unwrap();
        assert_eq!(key.decrypt(&ciphertext, &nonce).unwrap(), b"[]");
        assert!(ReadKey::generate().decrypt(&ciphertext, &nonce).is_err());
    }

    #[test]
    fn test_wrap_checks_key_id() {
        let outer = ReadKey::generate();
        let inner = ReadKey::generate();
        let wrapped = outer.wrap(&inner).unwrap();
        assert_eq!(outer.unwrap_key(&wrapped, &inner.id()).unwrap(), inner);
        assert!(matches!(
            outer.unwrap_key(&wrapped, &ReadKey::generate().id()),
            Err(PermsError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_agent_from_seed_is_deterministic() {
        let a = AgentSecret::from_seed(&[9; 32]);
        let b = AgentSecret::from_seed(&[9; 32]);
        assert_eq!(a.agent_id(), b.agent_id());
        assert_ne!(a.agent_id(), AgentSecret::from_seed(&[1; 32]).agent_id());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_tampered_ciphertext_is_rejected(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            position in any::<usize>(),
            bit in 0u8..8,
        ) {
            let key = ReadKey::from_bytes([5; 32]);
            let session = SessionId::new_random(AgentSecret::from_seed(&[5; 32]).agent_id());
            let nonce = ReadKey::transaction_nonce(&CoValueId::derive(b"doc"), &session, 0);
            let mut ciphertext = key.encrypt(&plaintext, &nonce).unwrap();
            let at = position % ciphertext.len();
            ciphertext[at] ^= 1 << bit;
            prop_assert!(key.decrypt(&ciphertext, &nonce).is_err());
        }
    }
}
