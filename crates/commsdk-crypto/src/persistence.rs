//! Encrypted persistence for the account key pair and group keys.
//!
//! PBKDF2 + AES-256-GCM keyed by the account secret.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::group::GroupKey;
use crate::identity::SerializableIdentityKeyPair;

const MAGIC: &[u8; 4] = b"CSKS"; // "CommSdk Key Store"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN + 4; // 53 bytes
const PBKDF2_ITERATIONS: u32 = 600_000;

/// Key material persisted between sessions.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct KeyStore {
    pub account: Option<SerializableIdentityKeyPair>,
    /// group id -> current group key
    pub group_keys: BTreeMap<String, GroupKey>,
    /// group id -> members holding the current key
    pub group_holders: BTreeMap<String, BTreeSet<String>>,
}

/// Derive a 256-bit AES-GCM key from password and salt.
fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> anyhow::Result<LessSafeKey> {
    let iterations =
        NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| anyhow::anyhow!("zero iterations"))?;
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key_bytes[..],
    );
    let unbound =
        UnboundKey::new(&AES_256_GCM, &key_bytes[..]).map_err(|_| anyhow::anyhow!("invalid key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn header_aad() -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(MAGIC);
    aad[4] = VERSION;
    aad
}

/// Encrypt a key store to a binary blob for disk storage.
///
/// File format: [CSKS magic(4)] [version(1)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
pub fn encrypt_store(store: &KeyStore, password: &str) -> anyhow::Result<Vec<u8>> {
    let rng = SystemRandom::new();

    let plaintext = Zeroizing::new(
        postcard::to_allocvec(store).map_err(|e| anyhow::anyhow!("serialization failed: {e}"))?,
    );

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| anyhow::anyhow!("RNG failed"))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| anyhow::anyhow!("RNG failed"))?;

    let key = derive_key(password, &salt)?;
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&header_aad()),
        &mut in_out,
    )
    .map_err(|_| anyhow::anyhow!("encryption failed"))?;

    let payload_len = in_out.len() as u32;
    let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
    file_data.extend_from_slice(MAGIC);
    file_data.push(VERSION);
    file_data.extend_from_slice(&salt);
    file_data.extend_from_slice(&nonce_bytes);
    file_data.extend_from_slice(&payload_len.to_be_bytes());
    file_data.extend_from_slice(&in_out);

    Ok(file_data)
}

/// Decrypt a key store from a binary blob.
pub fn decrypt_store(file_data: &[u8], password: &str) -> anyhow::Result<KeyStore> {
    if file_data.len() < HEADER_LEN {
        anyhow::bail!("file too short");
    }
    if &file_data[0..4] != MAGIC {
        anyhow::bail!("invalid file format (expected CSKS header)");
    }
    if file_data[4] != VERSION {
        anyhow::bail!("unsupported file version");
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&file_data[5..5 + SALT_LEN]);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&file_data[37..37 + NONCE_LEN]);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&file_data[49..53]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if file_data.len() < HEADER_LEN + payload_len {
        anyhow::bail!("file truncated");
    }

    let key = derive_key(password, &salt)?;

    let mut ciphertext = Zeroizing::new(file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec());
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&header_aad()),
            &mut ciphertext,
        )
        .map_err(|_| anyhow::anyhow!("incorrect password or corrupted file"))?;

    postcard::from_bytes(plaintext).map_err(|e| anyhow::anyhow!("deserialization failed: {e}"))
}

/// Check if file data starts with a valid CSKS header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}
