use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Account identifier assigned by the backend.
pub type UserId = String;

/// Group identifier.
pub type GroupId = String;

/// Call session identifier, unique per process.
pub type CallId = u64;

/// Message identifier, unique per sender.
pub type MessageId = String;

/// A user known to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    /// Email-like address used for friend lookup.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// 32-byte X25519 public key, present once the user enabled encryption.
    #[serde(default)]
    pub public_key: Option<Vec<u8>>,
    /// Public key verified against the backend certificate.
    #[serde(default)]
    pub encryption_ready: bool,
    /// Media key of the user's picture.
    #[serde(default)]
    pub image_key: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            address: None,
            phone: None,
            public_key: None,
            encryption_ready: false,
            image_key: None,
        }
    }

    /// A usable key for sealing payloads to this user.
    pub fn verified_public_key(&self) -> Option<&[u8]> {
        match &self.public_key {
            Some(key) if self.encryption_ready && key.len() == 32 => Some(key),
            _ => None,
        }
    }
}

/// A group of users. `encryption_ready` never contains a non-member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub owner: UserId,
    members: BTreeSet<UserId>,
    /// Identifier of the current group key, if encryption is enabled.
    #[serde(default)]
    pub key_id: Option<u32>,
    #[serde(default)]
    encryption_ready: BTreeSet<UserId>,
}

impl Group {
    pub fn new(
        id: impl Into<GroupId>,
        name: impl Into<String>,
        owner: impl Into<UserId>,
        members: impl IntoIterator<Item = UserId>,
    ) -> Self {
        let owner = owner.into();
        let mut members: BTreeSet<UserId> = members.into_iter().collect();
        members.insert(owner.clone());
        Self {
            id: id.into(),
            name: name.into(),
            owner,
            members,
            key_id: None,
            encryption_ready: BTreeSet::new(),
        }
    }

    pub fn members(&self) -> &BTreeSet<UserId> {
        &self.members
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    pub fn add_member(&mut self, user_id: impl Into<UserId>) -> bool {
        self.members.insert(user_id.into())
    }

    /// Removes a member along with their readiness entry.
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        self.encryption_ready.remove(user_id);
        self.members.remove(user_id)
    }

    pub fn encryption_ready(&self) -> &BTreeSet<UserId> {
        &self.encryption_ready
    }

    /// Marks a member as holding the current group key. Non-members are refused.
    pub fn mark_ready(&mut self, user_id: &str) -> bool {
        if !self.members.contains(user_id) {
            return false;
        }
        self.encryption_ready.insert(user_id.to_string());
        true
    }

    pub fn set_ready(&mut self, ready: impl IntoIterator<Item = UserId>) {
        self.encryption_ready = ready
            .into_iter()
            .filter(|id| self.members.contains(id))
            .collect();
    }

    pub fn clear_ready(&mut self) {
        self.encryption_ready.clear();
    }
}

// ── Media ─────────────────────────────────────────────────────────────

/// Declared type of a stored content blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Text,
    Image,
    UserImage,
    Video,
    Voicemail,
    File,
    VCard,
    Friend,
    Location,
}

impl MediaType {
    /// Key scheme for stored media. Text is never stored and has no scheme.
    pub fn scheme(self) -> Option<&'static str> {
        match self {
            Self::Text => None,
            Self::Image => Some("image"),
            Self::UserImage => Some("userimage"),
            Self::Video => Some("video"),
            Self::Voicemail => Some("audio"),
            Self::File => Some("file"),
            Self::VCard => Some("vcard"),
            Self::Friend => Some("friend"),
            Self::Location => Some("loc"),
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "image" => Some(Self::Image),
            "userimage" => Some(Self::UserImage),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Voicemail),
            "file" => Some(Self::File),
            "vcard" => Some(Self::VCard),
            "friend" => Some(Self::Friend),
            "loc" => Some(Self::Location),
            _ => None,
        }
    }

    /// Whether a message of this type can be carried over SMS.
    pub fn sms_representable(self) -> bool {
        !matches!(self, Self::VCard | Self::Friend)
    }
}

/// Opaque, content-addressed identifier of a stored blob.
///
/// Format: `<scheme>://<sha256 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaKey(String);

impl MediaKey {
    /// Builds a key from a media type and a 32-byte content digest.
    pub fn from_digest(media_type: MediaType, digest: &[u8; 32]) -> Result<Self, ProtocolError> {
        let scheme = media_type
            .scheme()
            .ok_or_else(|| ProtocolError::InvalidMediaKey(format!("{media_type:?}")))?;
        let mut hex = String::with_capacity(64);
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        Ok(Self(format!("{scheme}://{hex}")))
    }

    /// Strict parse: known scheme and a 64-char lowercase hex digest.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let Some((scheme, digest)) = s.split_once("://") else {
            return Err(ProtocolError::InvalidMediaKey(s.to_string()));
        };
        if MediaType::from_scheme(scheme).is_none()
            || digest.len() != 64
            || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(ProtocolError::InvalidMediaKey(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Best-effort classification from the key text alone.
    pub fn classify(s: &str) -> MediaType {
        s.split_once("://")
            .and_then(|(scheme, _)| MediaType::from_scheme(scheme))
            .unwrap_or(MediaType::Text)
    }

    pub fn media_type(&self) -> MediaType {
        Self::classify(&self.0)
    }

    /// Hex digest part of the key.
    pub fn digest_hex(&self) -> &str {
        self.0.split_once("://").map(|(_, d)| d).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Calls & messages ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaMode {
    AudioOnly,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// How a message reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryChannel {
    /// Over the live session while the app is in the foreground.
    InApp,
    /// Stored by the backend, recipient pulls after a push wake-up.
    Push,
    Sms,
}

/// Where a message or call is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    User(UserId),
    Group(GroupId),
    Phone(String),
}

/// Resynchronization requests issued by keepalive and explicit reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    Friends,
    Messages,
    Calls,
}

/// Raw login code as reported by the backend.
pub mod login_code {
    pub const SUCCESS: u32 = 0;
    pub const INVALID_PASSWORD: u32 = 2;
    pub const ERROR: u32 = 14;
}

/// Reply to a login attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginReply {
    pub code: u32,
    pub message: String,
    /// Account id, present on success.
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Fingerprint of the account key currently registered with the backend.
    #[serde(default)]
    pub key_fingerprint: Option<String>,
}
