//! Sealed boxes: anonymous public-key encryption to an account key.
//!
//! ephemeral X25519 -> HKDF-SHA256 -> AES-256-GCM.
//!
//! Wire form: `[ephemeral_pub: 32] [nonce: 12] [ciphertext + tag: 16]`

use hkdf::Hkdf;
use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::identity::IdentityKeyPair;

const HKDF_INFO: &[u8] = b"commsdk sealed v1";
const PUB_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes added to the plaintext by [`seal`].
pub const SEALED_OVERHEAD: usize = PUB_LEN + NONCE_LEN + TAG_LEN;

fn derive_key(
    shared: &[u8; 32],
    ephemeral_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> anyhow::Result<LessSafeKey> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_pub);
    salt[32..].copy_from_slice(recipient_pub);

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, &mut okm[..])
        .map_err(|_| anyhow::anyhow!("HKDF expand failed"))?;

    let unbound =
        UnboundKey::new(&AES_256_GCM, &okm[..]).map_err(|_| anyhow::anyhow!("invalid key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn to_public(bytes: &[u8]) -> anyhow::Result<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes, got {}", bytes.len()))?;
    Ok(PublicKey::from(arr))
}

/// Encrypt `plaintext` so that only the holder of `recipient_public`'s private key can read it.
pub fn seal(recipient_public: &[u8], aad: &[u8], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let recipient = to_public(recipient_public)?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        anyhow::bail!("recipient public key is a low-order point");
    }

    let key = derive_key(shared.as_bytes(), ephemeral_pub.as_bytes(), recipient.as_bytes())?;

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

    let mut sealed = Vec::with_capacity(SEALED_OVERHEAD + plaintext.len());
    sealed.extend_from_slice(ephemeral_pub.as_bytes());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Open a sealed box addressed to `identity`. `aad` must match the value used when sealing.
pub fn open(identity: &IdentityKeyPair, aad: &[u8], sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < SEALED_OVERHEAD {
        anyhow::bail!("sealed data too short: {} bytes", sealed.len());
    }

    let ephemeral_pub = to_public(&sealed[..PUB_LEN])?;
    let shared = identity.secret().diffie_hellman(&ephemeral_pub);
    if !shared.was_contributory() {
        anyhow::bail!("ephemeral key is a low-order point");
    }
    let key = derive_key(
        shared.as_bytes(),
        ephemeral_pub.as_bytes(),
        &identity.public_bytes(),
    )?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&sealed[PUB_LEN..PUB_LEN + NONCE_LEN]);

    let mut in_out = sealed[PUB_LEN + NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| anyhow::anyhow!("decryption failed: wrong recipient or tampered data"))?;
    Ok(plaintext.to_vec())
}
