//! Session Lifecycle Manager: the one per-process owner of every component.
//!
//! Components are created on `start` and torn down on `stop`/`logout`.
//! Inbound traffic from the transport is dispatched to them by a task that
//! lives as long as the login; the background keepalive is a second task that
//! only runs while the host is backgrounded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use commsdk_protocol::messages::Signal;
use commsdk_protocol::types::{login_code, Group, GroupId, Identity, LoginReply, SyncKind, UserId};

use crate::call::{CallStateMachine, EndReason};
use crate::capture::{CaptureDevice, CaptureSessionManager};
use crate::completion::Pending;
use crate::config::CoreConfig;
use crate::content_store::ContentStore;
use crate::error::{CoreError, TransportError};
use crate::events::{EventBus, EventHandler, Notification};
use crate::keys::KeyTrustManager;
use crate::link::SessionLink;
use crate::messaging::transcode::MediaTranscoder;
use crate::messaging::MessagingPipeline;
use crate::records::{self, MemoryRecordStore, Record, RecordKind, RecordStore};
use crate::transport::tls::TlsTransport;
use crate::transport::{
    BlobService, Credentials, Inbound, SessionChannel, SessionHandle, SessionTransport,
};

/// Set while a manager exists in this process.
static SESSION_EXISTS: AtomicBool = AtomicBool::new(false);

/// When the last full resync ran. Reset on logout.
static LAST_FULL_SYNC: Mutex<Option<Instant>> = Mutex::new(None);

fn last_full_sync() -> std::sync::MutexGuard<'static, Option<Instant>> {
    LAST_FULL_SYNC.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of a login attempt. Unknown backend codes are failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResult {
    Success { user_id: UserId },
    InvalidPassword,
    Error(String),
    Unrecognized { code: u32, message: String },
}

impl LoginResult {
    pub fn from_reply(reply: &LoginReply) -> Self {
        match (reply.code, &reply.user_id) {
            (login_code::SUCCESS, Some(user_id)) => Self::Success {
                user_id: user_id.clone(),
            },
            (login_code::INVALID_PASSWORD, _) => Self::InvalidPassword,
            (login_code::ERROR, _) => Self::Error(reply.message.clone()),
            (code, _) => Self::Unrecognized {
                code,
                message: reply.message.clone(),
            },
        }
    }

    /// Backend code for this result.
    pub fn code(&self) -> u32 {
        match self {
            Self::Success { .. } => login_code::SUCCESS,
            Self::InvalidPassword => login_code::INVALID_PASSWORD,
            Self::Error(_) => login_code::ERROR,
            Self::Unrecognized { code, .. } => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Worth retrying with the same credentials.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Unrecognized { .. })
    }
}

// ── Builder ───────────────────────────────────────────────────────────

pub struct SessionBuilder {
    transport: Arc<dyn SessionTransport>,
    blob_service: Option<Arc<dyn BlobService>>,
    records: Option<Arc<dyn RecordStore>>,
    capture_device: Option<Arc<dyn CaptureDevice>>,
    transcoder: Option<Arc<dyn MediaTranscoder>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    config: CoreConfig,
}

impl SessionBuilder {
    pub fn new(transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            transport,
            blob_service: None,
            records: None,
            capture_device: None,
            transcoder: None,
            handlers: Vec::new(),
            config: CoreConfig::default(),
        }
    }

    /// Use the TLS transport at `config.server_address` for both signaling
    /// and blobs.
    pub fn tls(config: CoreConfig) -> Result<Self, CoreError> {
        let address = config
            .server_address
            .clone()
            .ok_or_else(|| CoreError::Config("server_address is not set".into()))?;
        let tls = Arc::new(TlsTransport::new(address));
        Ok(Self::new(tls.clone()).blob_service(tls).config(config))
    }

    pub fn blob_service(mut self, blobs: Arc<dyn BlobService>) -> Self {
        self.blob_service = Some(blobs);
        self
    }

    pub fn records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.capture_device = Some(device);
        self
    }

    pub fn transcoder(mut self, transcoder: Arc<dyn MediaTranscoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Fails with [`CoreError::AlreadyRunning`] while another manager exists.
    pub fn build(self) -> Result<SessionLifecycleManager, CoreError> {
        if SESSION_EXISTS
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::AlreadyRunning);
        }
        let events = EventBus::new();
        for h in self.handlers {
            events.add_handler(h);
        }
        Ok(SessionLifecycleManager {
            inner: Arc::new(SessionInner {
                link: SessionLink::new(self.transport),
                records: self
                    .records
                    .unwrap_or_else(|| Arc::new(MemoryRecordStore::new())),
                blob_service: self.blob_service,
                capture_device: self.capture_device,
                transcoder: self.transcoder,
                config: self.config,
                events,
                state: Mutex::new(SessionState::default()),
                _guard: ProcessGuard,
            }),
        })
    }
}

/// Releases the per-process slot when the manager goes away.
struct ProcessGuard;

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        SESSION_EXISTS.store(false, Ordering::Release);
    }
}

// ── Manager ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct Components {
    store: ContentStore,
    keys: KeyTrustManager,
    messaging: MessagingPipeline,
    capture: CaptureSessionManager,
    calls: CallStateMachine,
}

#[derive(Default)]
struct SessionState {
    components: Option<Components>,
    background: bool,
    secret: Option<Zeroizing<String>>,
    push_token: Option<String>,
    dispatcher: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

struct SessionInner {
    link: SessionLink,
    records: Arc<dyn RecordStore>,
    blob_service: Option<Arc<dyn BlobService>>,
    capture_device: Option<Arc<dyn CaptureDevice>>,
    transcoder: Option<Arc<dyn MediaTranscoder>>,
    config: CoreConfig,
    events: EventBus,
    state: Mutex<SessionState>,
    _guard: ProcessGuard,
}

/// Clones are handles to the same session.
#[derive(Clone)]
pub struct SessionLifecycleManager {
    inner: Arc<SessionInner>,
}

impl SessionLifecycleManager {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn components(&self) -> Result<Components, CoreError> {
        self.state().components.clone().ok_or(CoreError::NotStarted)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn link(&self) -> &SessionLink {
        &self.inner.link
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.inner.records
    }

    pub fn calls(&self) -> Result<CallStateMachine, CoreError> {
        Ok(self.components()?.calls)
    }

    pub fn messaging(&self) -> Result<MessagingPipeline, CoreError> {
        Ok(self.components()?.messaging)
    }

    pub fn keys(&self) -> Result<KeyTrustManager, CoreError> {
        Ok(self.components()?.keys)
    }

    pub fn capture(&self) -> Result<CaptureSessionManager, CoreError> {
        Ok(self.components()?.capture)
    }

    pub fn content_store(&self) -> Result<ContentStore, CoreError> {
        Ok(self.components()?.store)
    }

    pub fn is_started(&self) -> bool {
        self.state().components.is_some()
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.link.is_connected()
    }

    pub fn is_background(&self) -> bool {
        self.state().background
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Create the components. Idempotent.
    pub fn start(&self) {
        let mut st = self.state();
        if st.components.is_some() {
            return;
        }
        let inner = &self.inner;
        let config = &inner.config;
        let store = ContentStore::new(
            inner.events.clone(),
            inner.blob_service.clone(),
            config.media_cache_dir(),
        );
        let keys = KeyTrustManager::new(inner.link.clone(), inner.records.clone(), inner.events.clone());
        let mut messaging = MessagingPipeline::new(
            inner.link.clone(),
            inner.records.clone(),
            store.clone(),
            keys.clone(),
            inner.events.clone(),
            config.clone(),
        );
        if let Some(t) = &inner.transcoder {
            messaging = messaging.with_transcoder(t.clone());
        }
        let capture = CaptureSessionManager::new(inner.capture_device.clone(), store.clone(), config.clone());
        let calls = CallStateMachine::new(
            inner.link.clone(),
            inner.records.clone(),
            inner.events.clone(),
            capture.clone(),
            config,
        );
        st.components = Some(Components {
            store,
            keys,
            messaging,
            capture,
            calls,
        });
        inner.link.set_foreground(!st.background);
        info!("session started");
    }

    /// Start for a background launch (push wake-up).
    pub fn start_in_background(&self) {
        self.state().background = true;
        self.start();
        self.did_enter_background();
    }

    /// Tear everything down and close the session.
    pub async fn stop(&self) {
        if let Some(handle) = self.teardown(EndReason::Disconnected) {
            self.inner.link.transport().disconnect(handle).await;
        }
        info!("session stopped");
    }

    /// Like [`stop`](Self::stop), and also forget the full-sync schedule.
    pub async fn logout(&self) {
        *last_full_sync() = None;
        if let Some(handle) = self.teardown(EndReason::LocalHangup) {
            self.inner.link.transport().disconnect(handle).await;
        }
        info!("logged out");
    }

    /// Synchronous part of stop/logout. Returns the handle still to disconnect.
    fn teardown(&self, reason: EndReason) -> Option<SessionHandle> {
        let (components, secret, tasks) = {
            let mut st = self.state();
            let tasks = [st.dispatcher.take(), st.keepalive.take()];
            (st.components.take(), st.secret.take(), tasks)
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        if let Some(c) = components {
            c.calls.end_all(reason);
            c.capture.shutdown();
            if let Some(secret) = &secret {
                self.save_keys(&c.keys, secret);
            }
            c.keys.clear();
        }
        self.inner.link.detach()
    }

    fn save_keys(&self, keys: &KeyTrustManager, secret: &str) {
        let Some(path) = self.inner.config.keystore_path() else {
            return;
        };
        match keys.save_to(&path, secret) {
            Ok(()) => debug!(path = %path.display(), "key store saved"),
            Err(e) => error!(path = %path.display(), "failed to save key store: {e:#}"),
        }
    }

    // ── Host lifecycle hooks ──────────────────────────────────────────

    pub fn will_resign_active(&self) {
        debug!("will resign active");
        self.inner.link.set_foreground(false);
    }

    /// Start the keepalive loop.
    pub fn did_enter_background(&self) {
        let mut st = self.state();
        st.background = true;
        self.inner.link.set_foreground(false);
        if st.keepalive.is_some() {
            return;
        }
        let period = self.inner.config.keepalive_interval();
        st.keepalive = Some(spawn_keepalive(Arc::downgrade(&self.inner), period));
        info!(interval_secs = period.as_secs(), "entered background, keepalive scheduled");
    }

    pub fn will_enter_foreground(&self) {
        let mut st = self.state();
        st.background = false;
        if let Some(task) = st.keepalive.take() {
            task.abort();
        }
        debug!("will enter foreground");
    }

    pub fn did_become_active(&self) {
        self.state().background = false;
        self.inner.link.set_foreground(true);
        self.refresh_application_badge();
    }

    /// Persist keys before the process goes away.
    pub fn will_terminate(&self) {
        let (keys, secret) = {
            let st = self.state();
            (
                st.components.as_ref().map(|c| c.keys.clone()),
                st.secret.clone(),
            )
        };
        if let (Some(keys), Some(secret)) = (keys, secret) {
            self.save_keys(&keys, &secret);
        }
        info!("will terminate");
    }

    // ── Login ─────────────────────────────────────────────────────────

    /// Log in. Starts the session if needed. The completion fires exactly once.
    pub fn login(&self, address: &str, secret: &str) -> Pending<LoginResult> {
        let address = address.trim().to_string();
        if address.is_empty() || secret.is_empty() {
            let result = LoginResult::Error("address and secret are required".into());
            self.inner.events.emit(Notification::LoginFailed {
                result: result.clone(),
            });
            return Pending::ready(result);
        }
        self.start();
        let this = self.clone();
        let secret = Zeroizing::new(secret.to_string());
        Pending::spawn(async move { this.run_login(address, secret).await })
    }

    async fn run_login(&self, address: String, secret: Zeroizing<String>) -> LoginResult {
        let credentials = Credentials {
            address: address.clone(),
            secret: secret.to_string(),
            push_token: self.state().push_token.clone(),
            sandbox: self.inner.config.sandbox_mode,
        };
        let result = match self.inner.link.transport().connect(&credentials).await {
            Err(e) => LoginResult::Error(e.to_string()),
            Ok((reply, channel)) => match (LoginResult::from_reply(&reply), channel) {
                (LoginResult::Success { user_id }, Some(channel)) => {
                    self.on_logged_in(&user_id, &address, &reply, channel, secret);
                    LoginResult::Success { user_id }
                }
                (LoginResult::Success { .. }, None) => {
                    LoginResult::Error("backend accepted login without a session".into())
                }
                (other, _) => other,
            },
        };

        match &result {
            LoginResult::Success { user_id } => {
                info!(user_id = %user_id, "login succeeded");
                self.inner.events.emit(Notification::LoginSucceeded {
                    user_id: user_id.clone(),
                });
            }
            other => {
                warn!(code = other.code(), "login failed: {other:?}");
                self.inner.events.emit(Notification::LoginFailed {
                    result: other.clone(),
                });
            }
        }
        result
    }

    fn on_logged_in(
        &self,
        user_id: &str,
        address: &str,
        reply: &LoginReply,
        channel: SessionChannel,
        secret: Zeroizing<String>,
    ) {
        let Ok(components) = self.components() else {
            warn!("login completed after the session stopped");
            return;
        };
        let link = &self.inner.link;
        if let Some(previous) = link.detach() {
            let transport = link.transport().clone();
            tokio::spawn(async move { transport.disconnect(previous).await });
        }
        link.attach(channel.handle, user_id.to_string());

        let records = self.inner.records.as_ref();
        if records::identity(records, user_id).is_none() {
            let mut me = Identity::new(user_id, address);
            me.address = Some(address.to_string());
            records.put(Record::Identity(me));
        }

        if let Some(path) = self.inner.config.keystore_path() {
            match components.keys.load_from(&path, &secret) {
                Ok(true) => info!("key store restored"),
                Ok(false) => {}
                Err(e) => warn!("key store not restored: {e:#}"),
            }
        }
        components
            .keys
            .set_remote_fingerprint(reply.key_fingerprint.clone());
        components.keys.validate_certificate_for_account();

        let dispatcher = tokio::spawn(dispatch_inbound(
            channel.inbound,
            components,
            link.clone(),
            self.inner.records.clone(),
            self.inner.events.clone(),
        ));
        let mut st = self.state();
        if let Some(old) = st.dispatcher.replace(dispatcher) {
            old.abort();
        }
        st.secret = Some(secret);
    }

    // ── Push and keepalive ────────────────────────────────────────────

    /// Forward a push token. Before login the token is kept and sent with the
    /// next login.
    pub fn register_push_token(&self, token: &str) -> Pending<Result<(), TransportError>> {
        self.state().push_token = Some(token.to_string());
        let Some(handle) = self.inner.link.handle() else {
            debug!("push token buffered until login");
            return Pending::ready(Ok(()));
        };
        let transport = self.inner.link.transport().clone();
        let token = token.to_string();
        let sandbox = self.inner.config.sandbox_mode;
        Pending::spawn(async move { transport.register_push_token(handle, &token, sandbox).await })
    }

    /// Refresh the session; run the full resync when it is due. Returns
    /// whether the resync ran.
    pub async fn keep_alive(&self) -> Result<bool, TransportError> {
        let handle = self.inner.link.handle().ok_or(TransportError::NotConnected)?;
        self.inner.link.transport().refresh(handle).await?;

        let due = {
            let mut last = last_full_sync();
            let interval = self.inner.config.full_sync_interval();
            let due = last.map_or(true, |t| t.elapsed() >= interval);
            if due {
                *last = Some(Instant::now());
            }
            due
        };
        if due {
            info!("running full resync");
            for kind in [SyncKind::Friends, SyncKind::Messages, SyncKind::Calls] {
                self.inner.link.send(Signal::SyncRequest { kind }).await?;
            }
        }
        Ok(due)
    }

    // ── Directory ─────────────────────────────────────────────────────

    /// Create a group owned by the current user. Members must be known
    /// identities.
    pub fn create_group(
        &self,
        name: &str,
        members: &[UserId],
    ) -> Result<Pending<Result<GroupId, TransportError>>, CoreError> {
        let me = self
            .inner
            .link
            .user_id()
            .ok_or(CoreError::Transport(TransportError::NotConnected))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("group name is empty".into()));
        }
        let records = self.inner.records.clone();
        if let Some(unknown) = members
            .iter()
            .find(|m| **m != me && records::identity(records.as_ref(), m).is_none())
        {
            return Err(CoreError::Validation(format!("unknown member {unknown}")));
        }

        let group = Group::new(uuid::Uuid::new_v4().to_string(), name, me, members.iter().cloned());
        Ok(Pending::spawn(announce_group(self.inner.link.clone(), records, group)))
    }

    pub fn find_friend(&self, address: &str) -> Pending<Result<(), TransportError>> {
        self.find_friends(&[address.to_string()])
    }

    /// Ask the backend which addresses belong to users. Matches arrive as a
    /// [`Notification::NewFriendsFound`].
    pub fn find_friends(&self, addresses: &[String]) -> Pending<Result<(), TransportError>> {
        let addresses: Vec<String> = addresses
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if addresses.is_empty() {
            return Pending::ready(Ok(()));
        }
        self.send_signal(Signal::FindFriends { addresses })
    }

    pub fn reload_friend_list(&self) -> Pending<Result<(), TransportError>> {
        self.send_signal(Signal::SyncRequest {
            kind: SyncKind::Friends,
        })
    }

    pub fn reload_message_history(&self) -> Pending<Result<(), TransportError>> {
        self.send_signal(Signal::SyncRequest {
            kind: SyncKind::Messages,
        })
    }

    pub fn reload_call_history(&self) -> Pending<Result<(), TransportError>> {
        self.send_signal(Signal::SyncRequest {
            kind: SyncKind::Calls,
        })
    }

    fn send_signal(&self, signal: Signal) -> Pending<Result<(), TransportError>> {
        let link = self.inner.link.clone();
        Pending::spawn(async move { link.send(signal).await })
    }

    /// Display name of a known user, or their address when the name is blank.
    pub fn name_for_user_id(&self, user_id: &str) -> Option<String> {
        let identity = records::identity(self.inner.records.as_ref(), user_id)?;
        let name = identity.display_name.trim();
        if name.is_empty() {
            identity.address
        } else {
            Some(name.to_string())
        }
    }

    /// Missed calls plus unread messages, emitted as a badge notification.
    /// `None` when the badge is disabled.
    pub fn refresh_application_badge(&self) -> Option<u32> {
        if !self.inner.config.use_application_badge {
            return None;
        }
        let missed = |r: &Record| matches!(r, Record::Call(c) if c.missed);
        let missed_calls = self
            .inner
            .records
            .query(RecordKind::Call, &missed, true, None)
            .len();
        let unread = self.messaging().map_or(0, |m| m.unread_count());
        let count = u32::try_from(missed_calls + unread).unwrap_or(u32::MAX);
        self.inner.events.emit(Notification::BadgeCount(count));
        Some(count)
    }
}

/// Announce a new group, then record it.
async fn announce_group(
    link: SessionLink,
    records: Arc<dyn RecordStore>,
    group: Group,
) -> Result<GroupId, TransportError> {
    link.send(Signal::GroupCreated(group.clone())).await?;
    info!(group_id = %group.id, members = group.members().len(), "group created");
    let id = group.id.clone();
    records.put(Record::Group(group));
    Ok(id)
}

fn spawn_keepalive(inner: Weak<SessionInner>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let manager = SessionLifecycleManager { inner };
            match manager.keep_alive().await {
                Ok(resynced) => debug!(resynced, "keepalive"),
                Err(e) => warn!("keepalive failed: {e}"),
            }
        }
    })
}

/// Route inbound traffic to the components until the session closes.
async fn dispatch_inbound(
    mut inbound: mpsc::Receiver<Inbound>,
    components: Components,
    link: SessionLink,
    records: Arc<dyn RecordStore>,
    events: EventBus,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Media(packet) => components.calls.on_media_packet(packet),
            Inbound::Signal(signal) => route_signal(signal, &components, records.as_ref(), &events).await,
            Inbound::Closed => break,
        }
    }
    warn!("session closed by transport");
    components.calls.end_all(EndReason::Disconnected);
    link.detach();
}

async fn route_signal(
    signal: Signal,
    components: &Components,
    records: &dyn RecordStore,
    events: &EventBus,
) {
    if signal.call_id().is_some() {
        components.calls.handle_signal(signal);
        return;
    }
    match signal {
        Signal::InstantMessage(_) | Signal::Sms { .. } | Signal::Ack { .. } | Signal::MessageFailed { .. } => {
            components.messaging.handle_signal(signal).await
        }
        Signal::PublicKeyPublished { .. } | Signal::GroupKeyDistribution { .. } | Signal::GroupKeyRevoked { .. } => {
            components.keys.handle_signal(signal)
        }
        Signal::GroupCreated(group) => {
            debug!(group_id = %group.id, "group announced");
            records.put(Record::Group(group));
        }
        Signal::NewFriends { friends } => {
            for friend in &friends {
                // Keep key state we already verified.
                let merged = match records::identity(records, &friend.id) {
                    Some(mut known) => {
                        known.display_name = friend.display_name.clone();
                        known.address = friend.address.clone().or(known.address);
                        known.phone = friend.phone.clone().or(known.phone);
                        known
                    }
                    None => friend.clone(),
                };
                records.put(Record::Identity(merged));
            }
            info!(count = friends.len(), "new friends found");
            events.emit(Notification::NewFriendsFound { friends });
        }
        other => debug!("ignoring inbound {other:?}"),
    }
}
