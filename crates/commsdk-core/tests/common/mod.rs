//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use commsdk_core::capture::{CameraPosition, CaptureDevice, FrameSink, VideoFrame};
use commsdk_core::error::{CaptureError, TransportError};
use commsdk_core::events::Notification;
use commsdk_core::transport::{
    BlobService, Credentials, Inbound, ProgressFn, SessionChannel, SessionHandle, SessionTransport,
};
use commsdk_core::{CoreConfig, SessionBuilder, SessionLifecycleManager};
use commsdk_protocol::media::MediaPacket;
use commsdk_protocol::messages::Signal;
use commsdk_protocol::types::{login_code, LoginReply, MediaKey};

// ── Transport ─────────────────────────────────────────────────────────

/// Scripted backend: accepts one account, records everything sent.
pub struct MockTransport {
    user_id: String,
    password: String,
    /// Overrides the login code for the next attempts.
    pub forced_code: Mutex<Option<u32>>,
    pub key_fingerprint: Mutex<Option<String>>,
    pub fail_signals: AtomicBool,
    pub logins: Mutex<Vec<Credentials>>,
    pub signals: Mutex<Vec<Signal>>,
    pub media: Mutex<Vec<MediaPacket>>,
    pub refreshes: AtomicU32,
    /// `(token, sandbox)` per registration.
    pub push_tokens: Mutex<Vec<(String, bool)>>,
    pub disconnects: AtomicU32,
    inbound: Mutex<Option<mpsc::Sender<Inbound>>>,
}

impl MockTransport {
    pub fn new(user_id: &str, password: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            password: password.into(),
            forced_code: Mutex::new(None),
            key_fingerprint: Mutex::new(None),
            fail_signals: AtomicBool::new(false),
            logins: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            media: Mutex::new(Vec::new()),
            refreshes: AtomicU32::new(0),
            push_tokens: Mutex::new(Vec::new()),
            disconnects: AtomicU32::new(0),
            inbound: Mutex::new(None),
        })
    }

    /// Deliver an inbound event as if the backend sent it.
    pub async fn inject(&self, event: Inbound) {
        let tx = self.inbound.lock().unwrap().clone().expect("no session");
        tx.send(event).await.expect("dispatcher gone");
    }

    pub async fn inject_signal(&self, signal: Signal) {
        self.inject(Inbound::Signal(signal)).await;
    }

    pub fn sent(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.signals.lock().unwrap().clear();
    }
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<(LoginReply, Option<SessionChannel>), TransportError> {
        self.logins.lock().unwrap().push(credentials.clone());
        let code = self.forced_code.lock().unwrap().unwrap_or(
            if credentials.address == self.user_id && credentials.secret == self.password {
                login_code::SUCCESS
            } else {
                login_code::INVALID_PASSWORD
            },
        );
        let reply = LoginReply {
            code,
            message: if code == login_code::SUCCESS { "ok" } else { "rejected" }.into(),
            user_id: (code == login_code::SUCCESS).then(|| self.user_id.clone()),
            key_fingerprint: self.key_fingerprint.lock().unwrap().clone(),
        };
        if code != login_code::SUCCESS {
            return Ok((reply, None));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.inbound.lock().unwrap() = Some(tx);
        Ok((
            reply,
            Some(SessionChannel {
                handle: SessionHandle(1),
                inbound: rx,
            }),
        ))
    }

    async fn disconnect(&self, _handle: SessionHandle) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn send_signal(&self, _handle: SessionHandle, signal: Signal) -> Result<(), TransportError> {
        if self.fail_signals.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted failure".into()));
        }
        self.signals.lock().unwrap().push(signal);
        Ok(())
    }

    async fn send_media(&self, _handle: SessionHandle, packet: MediaPacket) -> Result<(), TransportError> {
        self.media.lock().unwrap().push(packet);
        Ok(())
    }

    async fn refresh(&self, _handle: SessionHandle) -> Result<(), TransportError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn register_push_token(
        &self,
        _handle: SessionHandle,
        token: &str,
        sandbox: bool,
    ) -> Result<(), TransportError> {
        self.push_tokens.lock().unwrap().push((token.to_string(), sandbox));
        Ok(())
    }
}

// ── Blob service ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemBlobService {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl BlobService for MemBlobService {
    async fn upload(&self, key: &MediaKey, data: Vec<u8>) -> Result<(), TransportError> {
        self.blobs.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn download(&self, key: &MediaKey, progress: &ProgressFn) -> Result<Vec<u8>, TransportError> {
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| TransportError::BlobMissing(key.to_string()))?;
        let total = data.len() as u64;
        progress(total / 2, total);
        progress(total, total);
        Ok(data)
    }
}

// ── Camera ────────────────────────────────────────────────────────────

/// Camera with front and rear positions; frames are pushed by the test.
#[derive(Default)]
pub struct FakeCamera {
    pub sink: Mutex<Option<FrameSink>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

impl FakeCamera {
    pub fn push(&self, seq: u64) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.push(VideoFrame::new(4, 4, vec![128; 4 * 4 * 3], seq));
        }
    }
}

impl CaptureDevice for FakeCamera {
    fn available_positions(&self) -> Vec<CameraPosition> {
        vec![CameraPosition::Front, CameraPosition::Rear]
    }

    fn start(&self, _position: CameraPosition, sink: FrameSink) -> Result<(), CaptureError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sink.lock().unwrap().take();
    }
}

// ── Session helpers ───────────────────────────────────────────────────

pub const USER: &str = "alice";
pub const PASSWORD: &str = "hunter2";

pub struct Harness {
    pub session: SessionLifecycleManager,
    pub transport: Arc<MockTransport>,
    pub blobs: Arc<MemBlobService>,
    pub camera: Arc<FakeCamera>,
}

pub fn harness(config: CoreConfig) -> Harness {
    let transport = MockTransport::new(USER, PASSWORD);
    let blobs = Arc::new(MemBlobService::default());
    let camera = Arc::new(FakeCamera::default());
    let session = SessionBuilder::new(transport.clone())
        .blob_service(blobs.clone())
        .capture_device(camera.clone())
        .config(config)
        .build()
        .expect("another session is alive");
    Harness {
        session,
        transport,
        blobs,
        camera,
    }
}

/// A harness already logged in as [`USER`].
pub async fn logged_in(config: CoreConfig) -> Harness {
    let h = harness(config);
    let result = h.session.login(USER, PASSWORD).await.expect("completion dropped");
    assert!(result.is_success(), "login failed: {result:?}");
    h
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Drain everything currently queued on a notification receiver.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}
