use thiserror::Error;

use commsdk_protocol::types::{DeliveryChannel, MediaType};
use commsdk_protocol::ProtocolError;

/// Failures of the session transport or blob service.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("blob not found: {0}")]
    BlobMissing(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Typed content-pipeline error reported by message and rich-media submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid target: {0:?}")]
    InvalidTarget(String),

    #[error("not connected")]
    NotConnected,

    #[error("cannot read media source: {0}")]
    Source(String),

    #[error("transcode failed: {0}")]
    Transcode(String),

    #[error("content store write failed: {0}")]
    StoreWrite(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("{media_type:?} cannot be delivered over {channel:?}")]
    UnsupportedForChannel {
        media_type: MediaType,
        channel: DeliveryChannel,
    },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("unknown media key: {0}")]
    UnknownKey(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("content does not match key {0}")]
    IntegrityMismatch(String),

    #[error("cannot decrypt content: {0}")]
    Decrypt(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("another call is in progress")]
    Busy,

    #[error("invalid phone number: {0:?}")]
    InvalidNumber(String),

    #[error("unknown callee: {0}")]
    UnknownCallee(String),

    #[error("operation not valid in call state {0}")]
    InvalidState(String),

    #[error("not connected")]
    NotConnected,

    #[error("signaling failed: {0}")]
    SignalingFailed(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no frame available")]
    NoFrame,

    #[error("no active capture sub-session")]
    NoActiveSession,

    #[error("a capture sub-session is already running")]
    AlreadyRunning,

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("capture device failure: {0}")]
    Device(String),

    #[error("content store write failed: {0}")]
    Store(String),
}

/// Key & trust operation failures (after the request was accepted).
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key pair payload: {0}")]
    InvalidPayload(String),

    #[error("encryption is not enabled for this account")]
    NotEnabled,

    #[error("no verified key for {0}")]
    NoVerifiedKey(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Façade-level failures.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("a session manager already exists in this process")]
    AlreadyRunning,

    #[error("session not started")]
    NotStarted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
