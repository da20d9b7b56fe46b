//! Account key pair generation, fingerprints and QR payload import/export.
//!
//! Each account owns one long-term X25519 key pair. Only the public half is
//! published; the private half leaves the process solely through the QR
//! payload the user explicitly exports.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Prefix of an exported key pair payload (format version 1).
pub const QR_PREFIX: &str = "CSKP1:";

/// private(32) + public(32) + created_at(8) + checksum(4)
const QR_BODY_LEN: usize = 76;

/// An account key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
    /// Unix seconds at generation time.
    pub created_at: u64,
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl IdentityKeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            created_at: unix_now(),
        }
    }

    fn from_parts(private_key: [u8; 32], created_at: u64) -> Self {
        let secret = StaticSecret::from(private_key);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            created_at,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Short hex fingerprint of the public key, used to detect key drift.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.public.as_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Encode the full key pair as a portable QR payload.
    pub fn export_qr_payload(&self) -> Zeroizing<String> {
        let mut body = Zeroizing::new(Vec::with_capacity(QR_BODY_LEN));
        body.extend_from_slice(self.secret.as_bytes());
        body.extend_from_slice(self.public.as_bytes());
        body.extend_from_slice(&self.created_at.to_be_bytes());
        let checksum = Sha256::digest(&body[..]);
        body.extend_from_slice(&checksum[..4]);
        Zeroizing::new(format!("{QR_PREFIX}{}", URL_SAFE_NO_PAD.encode(&body[..])))
    }

    /// Decode a QR payload. Any malformation fails the whole import.
    pub fn import_qr_payload(payload: &str) -> anyhow::Result<Self> {
        let Some(encoded) = payload.trim().strip_prefix(QR_PREFIX) else {
            anyhow::bail!("unrecognized key pair payload");
        };
        let body = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|e| anyhow::anyhow!("invalid payload encoding: {e}"))?,
        );
        if body.len() != QR_BODY_LEN {
            anyhow::bail!("payload has wrong length: {}", body.len());
        }

        let checksum = Sha256::digest(&body[..72]);
        if checksum[..4] != body[72..76] {
            anyhow::bail!("payload checksum mismatch");
        }

        let mut private_key = Zeroizing::new([0u8; 32]);
        private_key.copy_from_slice(&body[..32]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&body[64..72]);

        let pair = Self::from_parts(*private_key, u64::from_be_bytes(created));
        if pair.public.as_bytes()[..] != body[32..64] {
            anyhow::bail!("public key does not match private key");
        }
        Ok(pair)
    }

    pub fn to_serializable(&self) -> SerializableIdentityKeyPair {
        SerializableIdentityKeyPair {
            public_key: self.public.to_bytes(),
            private_key: self.secret.to_bytes(),
            created_at: self.created_at,
        }
    }
}

/// Fingerprint of a raw 32-byte public key.
pub fn fingerprint_of(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Serializable form of an [`IdentityKeyPair`], only ever written encrypted.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableIdentityKeyPair {
    pub public_key: [u8; 32],
    pub private_key: [u8; 32],
    pub created_at: u64,
}

impl SerializableIdentityKeyPair {
    pub fn to_identity_key_pair(&self) -> anyhow::Result<IdentityKeyPair> {
        let pair = IdentityKeyPair::from_parts(self.private_key, self.created_at);
        if pair.public.to_bytes() != self.public_key {
            anyhow::bail!("stored public key does not match private key");
        }
        Ok(pair)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = IdentityKeyPair::generate();
        let restored = pair.to_serializable().to_identity_key_pair().unwrap();
        assert_eq!(pair.public_bytes(), restored.public_bytes());
        assert_eq!(pair.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn fingerprint_is_hex_of_fixed_length() {
        let pair = IdentityKeyPair::generate();
        let fp = pair.fingerprint();
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fp, IdentityKeyPair::generate().fingerprint());
    }

    #[test]
    fn qr_payload_roundtrip() {
        let pair = IdentityKeyPair::generate();
        let payload = pair.export_qr_payload();
        assert!(payload.starts_with(QR_PREFIX));
        let imported = IdentityKeyPair::import_qr_payload(&payload).unwrap();
        assert_eq!(imported.public_bytes(), pair.public_bytes());
        assert_eq!(imported.created_at, pair.created_at);
    }

    #[test]
    fn qr_import_rejects_garbage() {
        assert!(IdentityKeyPair::import_qr_payload("").is_err());
        assert!(IdentityKeyPair::import_qr_payload("CSKP1:!!!").is_err());
        assert!(IdentityKeyPair::import_qr_payload("CSKP1:AAAA").is_err());
        assert!(IdentityKeyPair::import_qr_payload("hello world").is_err());
    }

    #[test]
    fn qr_import_rejects_tampered_payload() {
        let pair = IdentityKeyPair::generate();
        let payload = pair.export_qr_payload();
        let encoded = payload.strip_prefix(QR_PREFIX).unwrap();
        let mut body = URL_SAFE_NO_PAD.decode(encoded).unwrap();
        body[40] ^= 0x01;
        let tampered = format!("{QR_PREFIX}{}", URL_SAFE_NO_PAD.encode(&body));
        assert!(IdentityKeyPair::import_qr_payload(&tampered).is_err());
    }

    #[test]
    fn serializable_rejects_mismatched_public() {
        let mut s = IdentityKeyPair::generate().to_serializable();
        s.public_key[0] ^= 0xFF;
        assert!(s.to_identity_key_pair().is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let pair = IdentityKeyPair::generate();
        let dbg = format!("{pair:?}");
        assert!(dbg.contains("fingerprint"));
        assert!(!dbg.contains("secret"));
    }
}
