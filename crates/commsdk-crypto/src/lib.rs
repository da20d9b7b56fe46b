//! commsdk cryptographic layer: account key pairs, sealed boxes and group keys.
//!
//! This crate provides:
//! - X25519 account key pairs with fingerprints and a portable QR payload
//! - Sealed-box public-key encryption (X25519 + HKDF-SHA256 + AES-256-GCM)
//! - Symmetric AES-256-GCM group keys, wrapped per member with a sealed box
//! - Encrypted persistence of the key store

pub mod group;
pub mod identity;
pub mod persistence;
pub mod sealed;

pub use group::{group_wrap_aad, GroupKey};
pub use identity::{IdentityKeyPair, SerializableIdentityKeyPair};
pub use persistence::KeyStore;
pub use sealed::{open, seal, SEALED_OVERHEAD};
