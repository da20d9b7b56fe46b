//! Symmetric group keys.
//!
//! A group key is a random AES-256-GCM key shared by the encryption-ready
//! members of a group. Each member receives their own copy sealed to their
//! account public key; a fresh key (new `key_id`) is generated whenever
//! members are removed.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::IdentityKeyPair;
use crate::sealed;

const NONCE_LEN: usize = 12;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    /// Incrementing key identifier (for rotation transitions).
    pub key_id: u32,
    key_bytes: [u8; 32],
}

/// AAD binding a wrapped copy to its group and key generation.
pub fn group_wrap_aad(group_id: &str, key_id: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(group_id.len() + 4);
    aad.extend_from_slice(group_id.as_bytes());
    aad.extend_from_slice(&key_id.to_be_bytes());
    aad
}

impl GroupKey {
    /// Generate a fresh random group key.
    pub fn generate(key_id: u32) -> anyhow::Result<Self> {
        let mut key_bytes = [0u8; 32];
        SystemRandom::new()
            .fill(&mut key_bytes)
            .map_err(|_| anyhow::anyhow!("RNG failed"))?;
        Ok(Self { key_id, key_bytes })
    }

    fn to_aead_key(&self) -> anyhow::Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key_bytes)
            .map_err(|_| anyhow::anyhow!("invalid key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Seal a copy of this key to one member's public key.
    pub fn wrap_for(&self, group_id: &str, recipient_public: &[u8]) -> anyhow::Result<Vec<u8>> {
        sealed::seal(
            recipient_public,
            &group_wrap_aad(group_id, self.key_id),
            &self.key_bytes,
        )
    }

    /// Open a wrapped copy addressed to `identity`.
    pub fn unwrap_from(
        identity: &IdentityKeyPair,
        group_id: &str,
        key_id: u32,
        wrapped: &[u8],
    ) -> anyhow::Result<Self> {
        let mut plain = sealed::open(identity, &group_wrap_aad(group_id, key_id), wrapped)?;
        if plain.len() != 32 {
            plain.zeroize();
            anyhow::bail!("wrapped group key has wrong length");
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&plain);
        plain.zeroize();
        Ok(Self { key_id, key_bytes })
    }

    /// Encrypt with a random nonce. Output: `[nonce: 12] [ciphertext + tag]`.
    pub fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let key = self.to_aead_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow::anyhow!("RNG failed"))?;

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| anyhow::anyhow!("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    pub fn decrypt(&self, aad: &[u8], data: &[u8]) -> anyhow::Result<Vec<u8>> {
        if data.len() < NONCE_LEN + GCM_TAG_SIZE {
            anyhow::bail!("ciphertext too short");
        }
        let key = self.to_aead_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&data[..NONCE_LEN]);

        let mut in_out = data[NONCE_LEN..].to_vec();
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| anyhow::anyhow!("decryption failed: invalid key or tampered data"))?;
        Ok(plaintext.to_vec())
    }
}
