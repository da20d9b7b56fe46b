use serde::{Deserialize, Serialize};

use crate::types::*;

/// Plaintext content of an instant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
    /// Stored media referenced by this message, if any.
    #[serde(default)]
    pub media_key: Option<String>,
}

/// Body of an instant message as it travels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    Plain(MessagePayload),
    /// Postcard-encoded `MessagePayload` sealed to the recipient's public key.
    Sealed(Vec<u8>),
    /// Postcard-encoded `MessagePayload` encrypted with a group key.
    GroupSealed { key_id: u32, ciphertext: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantMessage {
    pub message_id: MessageId,
    pub from: UserId,
    pub target: Target,
    pub body: MessageBody,
    pub delivery: DeliveryChannel,
    /// Group sends: members able to read the body.
    #[serde(default)]
    pub recipients: Vec<UserId>,
    /// Unix milliseconds.
    pub sent_at: u64,
}

/// One member's copy of a wrapped group key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedGroupKey {
    pub member: UserId,
    pub sealed: Vec<u8>,
}

/// Call, message and key signaling carried over the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Signal {
    // ── Calls ─────────────────────────────────────────────────────────
    Invite {
        call_id: CallId,
        from: UserId,
        from_name: String,
        target: Target,
        video: bool,
        #[serde(default)]
        members: Vec<UserId>,
    },
    Accept { call_id: CallId, video: bool },
    Reject { call_id: CallId },
    Hangup { call_id: CallId },
    /// Backend confirmed media is flowing both ways.
    MediaFlowing { call_id: CallId },
    MemberJoined { call_id: CallId, user_id: UserId },
    MemberLeft { call_id: CallId, user_id: UserId },
    CallFailed { call_id: CallId, reason: String },

    // ── Messages ──────────────────────────────────────────────────────
    InstantMessage(InstantMessage),
    Sms {
        message_id: MessageId,
        from: UserId,
        number: String,
        segments: Vec<String>,
    },
    Ack { message_id: MessageId },
    MessageFailed { message_id: MessageId, reason: String },

    // ── Keys ──────────────────────────────────────────────────────────
    PublicKeyPublished {
        user_id: UserId,
        /// None when the account disabled encryption.
        public_key: Option<Vec<u8>>,
    },
    GroupKeyDistribution {
        group_id: GroupId,
        key_id: u32,
        from: UserId,
        wrapped: Vec<WrappedGroupKey>,
    },
    GroupKeyRevoked { group_id: GroupId },

    // ── Directory ─────────────────────────────────────────────────────
    GroupCreated(Group),
    FindFriends { addresses: Vec<String> },
    SyncRequest { kind: SyncKind },
    NewFriends { friends: Vec<Identity> },
}

impl Signal {
    /// Call id for call signaling variants.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Invite { call_id, .. }
            | Self::Accept { call_id, .. }
            | Self::Reject { call_id }
            | Self::Hangup { call_id }
            | Self::MediaFlowing { call_id }
            | Self::MemberJoined { call_id, .. }
            | Self::MemberLeft { call_id, .. }
            | Self::CallFailed { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }
}

/// Frames sent from the SDK to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First frame after the TLS handshake.
    Login {
        address: String,
        secret: String,
        protocol_version: u32,
        app_version: String,
        #[serde(default)]
        push_token: Option<String>,
        /// Push credentials belong to the sandbox environment.
        #[serde(default)]
        sandbox: bool,
    },
    Signal(Signal),
    /// Encoded `MediaPacket` for an active call.
    Media(Vec<u8>),
    PutBlobChunk {
        key: String,
        offset: u64,
        total: u64,
        data: Vec<u8>,
    },
    GetBlob { key: String },
    RegisterPush { token: String, sandbox: bool },
    Ping { timestamp: u64 },
    Disconnect,
}

/// Frames sent from the backend to the SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    LoginReply(LoginReply),
    Signal(Signal),
    Media(Vec<u8>),
    BlobChunk {
        key: String,
        offset: u64,
        total: u64,
        data: Vec<u8>,
    },
    BlobStored { key: String },
    BlobMissing { key: String },
    Pong { timestamp: u64 },
    Error { message: String },
}
