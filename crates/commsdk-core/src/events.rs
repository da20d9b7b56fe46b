//! Out-of-band notifications and host event handlers.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use commsdk_protocol::messages::MessagePayload;
use commsdk_protocol::types::{CallId, GroupId, Identity, MediaKey, MessageId, UserId};

use crate::call::{CallState, EndReason};
use crate::session::LoginResult;

const CHANNEL_CAPACITY: usize = 256;

/// Logical events emitted by the core.
#[derive(Debug, Clone)]
pub enum Notification {
    LoginSucceeded { user_id: UserId },
    LoginFailed { result: LoginResult },

    CallStateChanged { call_id: CallId, state: CallState },
    IncomingCall { call_id: CallId, from: UserId, video: bool },
    CallEnded { call_id: CallId, reason: EndReason },
    ConnectionStalling { call_id: CallId },
    ConnectionResumed { call_id: CallId },
    VideoStalling { call_id: CallId },
    VideoResumed { call_id: CallId },

    /// Download progress for a media key, 0-100.
    DownloadProgress { key: MediaKey, percent: u8 },

    MessageReceived { message_id: MessageId, from: UserId, payload: MessagePayload },
    MessageDelivered { message_id: MessageId },
    MessageFailed { message_id: MessageId, reason: String },

    GroupKeyInstalled { group_id: GroupId, key_id: u32 },
    /// The account key registered with the backend no longer matches ours.
    KeyDriftDetected,

    NewFriendsFound { friends: Vec<Identity> },
    BadgeCount(u32),
}

/// Host callbacks. Every method has a no-op default; override what you need.
pub trait EventHandler: Send + Sync {
    fn on_login(&self, _result: &LoginResult) {}
    fn on_call_state(&self, _call_id: CallId, _state: CallState) {}
    fn on_incoming_call(&self, _call_id: CallId, _from: &UserId, _video: bool) {}
    fn on_call_ended(&self, _call_id: CallId, _reason: &EndReason) {}
    fn on_connection_stall(&self, _call_id: CallId, _stalling: bool) {}
    fn on_video_stall(&self, _call_id: CallId, _stalling: bool) {}
    fn on_download_progress(&self, _key: &MediaKey, _percent: u8) {}
    fn on_message(&self, _from: &UserId, _payload: &MessagePayload) {}
    fn on_new_friends(&self, _friends: &[Identity]) {}
    /// Receives every notification, after the specific method.
    fn on_notification(&self, _notification: &Notification) {}
}

struct EventBusInner {
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
    tx: broadcast::Sender<Notification>,
}

/// Fan-out of notifications to registered handlers and broadcast subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EventBusInner {
                handlers: Mutex::new(Vec::new()),
                tx,
            }),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.tx.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        let handlers = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for h in &handlers {
            dispatch(h.as_ref(), &notification);
            h.on_notification(&notification);
        }
        // No subscribers is fine.
        let _ = self.inner.tx.send(notification);
    }
}

fn dispatch(h: &dyn EventHandler, n: &Notification) {
    match n {
        Notification::LoginSucceeded { user_id } => h.on_login(&LoginResult::Success {
            user_id: user_id.clone(),
        }),
        Notification::LoginFailed { result } => h.on_login(result),
        Notification::CallStateChanged { call_id, state } => h.on_call_state(*call_id, *state),
        Notification::IncomingCall { call_id, from, video } => {
            h.on_incoming_call(*call_id, from, *video)
        }
        Notification::CallEnded { call_id, reason } => h.on_call_ended(*call_id, reason),
        Notification::ConnectionStalling { call_id } => h.on_connection_stall(*call_id, true),
        Notification::ConnectionResumed { call_id } => h.on_connection_stall(*call_id, false),
        Notification::VideoStalling { call_id } => h.on_video_stall(*call_id, true),
        Notification::VideoResumed { call_id } => h.on_video_stall(*call_id, false),
        Notification::DownloadProgress { key, percent } => h.on_download_progress(key, *percent),
        Notification::MessageReceived { from, payload, .. } => h.on_message(from, payload),
        Notification::NewFriendsFound { friends } => h.on_new_friends(friends),
        _ => {}
    }
}
