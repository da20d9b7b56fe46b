//! External interfaces: session transport and blob service.
//!
//! The core never talks to the network directly; everything goes through
//! these traits. [`tls::TlsTransport`] implements both over TLS.

pub mod tls;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use commsdk_protocol::media::MediaPacket;
use commsdk_protocol::messages::Signal;
use commsdk_protocol::types::{LoginReply, MediaKey};

use crate::error::TransportError;

/// Opaque handle for a connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

#[derive(Clone)]
pub struct Credentials {
    pub address: String,
    pub secret: String,
    pub push_token: Option<String>,
    /// Route push credentials to the sandbox environment.
    pub sandbox: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("push_token", &self.push_token.is_some())
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

/// Events delivered by a live session.
#[derive(Debug)]
pub enum Inbound {
    Signal(Signal),
    Media(MediaPacket),
    /// The session ended from the remote side or the link dropped.
    Closed,
}

/// A connected session: its handle plus the inbound event stream.
pub struct SessionChannel {
    pub handle: SessionHandle,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// Signaling and call-media channel to the backend.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Authenticate. A channel is returned only when the login succeeded.
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<(LoginReply, Option<SessionChannel>), TransportError>;

    async fn disconnect(&self, handle: SessionHandle);

    async fn send_signal(&self, handle: SessionHandle, signal: Signal) -> Result<(), TransportError>;

    async fn send_media(
        &self,
        handle: SessionHandle,
        packet: MediaPacket,
    ) -> Result<(), TransportError>;

    /// Refresh the session so the backend keeps it alive.
    async fn refresh(&self, handle: SessionHandle) -> Result<(), TransportError>;

    async fn register_push_token(
        &self,
        handle: SessionHandle,
        token: &str,
        sandbox: bool,
    ) -> Result<(), TransportError>;
}

/// Progress callback: `(bytes_received, bytes_total)`.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Remote storage for content blobs.
#[async_trait]
pub trait BlobService: Send + Sync {
    async fn upload(&self, key: &MediaKey, data: Vec<u8>) -> Result<(), TransportError>;

    async fn download(&self, key: &MediaKey, progress: &ProgressFn)
        -> Result<Vec<u8>, TransportError>;
}
