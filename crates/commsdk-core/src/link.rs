use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use commsdk_protocol::media::MediaPacket;
use commsdk_protocol::messages::Signal;
use commsdk_protocol::types::UserId;

use crate::error::TransportError;
use crate::transport::{SessionHandle, SessionTransport};

#[derive(Default)]
struct LinkState {
    handle: Option<SessionHandle>,
    user_id: Option<UserId>,
}

struct LinkInner {
    transport: Arc<dyn SessionTransport>,
    state: Mutex<LinkState>,
    foreground: AtomicBool,
}

/// The live session shared by every component: transport, handle and the
/// logged-in account.
#[derive(Clone)]
pub struct SessionLink {
    inner: Arc<LinkInner>,
}

impl SessionLink {
    pub fn new(transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                transport,
                state: Mutex::new(LinkState::default()),
                foreground: AtomicBool::new(true),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> &Arc<dyn SessionTransport> {
        &self.inner.transport
    }

    pub(crate) fn attach(&self, handle: SessionHandle, user_id: UserId) {
        let mut st = self.state();
        st.handle = Some(handle);
        st.user_id = Some(user_id);
    }

    /// Forget the session. Returns the handle that was attached.
    pub(crate) fn detach(&self) -> Option<SessionHandle> {
        let mut st = self.state();
        st.user_id = None;
        st.handle.take()
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.state().handle
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state().user_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().handle.is_some()
    }

    pub fn is_foreground(&self) -> bool {
        self.inner.foreground.load(Ordering::Relaxed)
    }

    pub(crate) fn set_foreground(&self, foreground: bool) {
        self.inner.foreground.store(foreground, Ordering::Relaxed);
    }

    pub async fn send(&self, signal: Signal) -> Result<(), TransportError> {
        let handle = self.handle().ok_or(TransportError::NotConnected)?;
        self.inner.transport.send_signal(handle, signal).await
    }

    pub async fn send_media(&self, packet: MediaPacket) -> Result<(), TransportError> {
        let handle = self.handle().ok_or(TransportError::NotConnected)?;
        self.inner.transport.send_media(handle, packet).await
    }
}
