//! Capture Session Manager.
//!
//! Sole owner of the camera. Frames from the device (or from the host, with
//! external capture) are fanned out to at most two consumers through
//! single-slot buffers, so a stalled consumer only loses frames and never
//! holds up the producer. Recording and screen capture run as separate
//! sub-sessions and land in the content store when stopped.

pub mod recording;
mod slot;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, info, warn};

use commsdk_protocol::types::{MediaKey, MediaType};

use crate::completion::Pending;
use crate::config::CoreConfig;
use crate::content_store::ContentStore;
use crate::error::CaptureError;

use recording::{Recorder, RecordingContainer, ScreenRecorder};
use slot::FrameSlot;

/// Frame consumers accepted at the same time.
pub const MAX_CONSUMERS: usize = 2;

/// Sample rate of PCM pushed through [`CaptureSessionManager::push_audio`].
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraPosition {
    Front,
    Rear,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureConfiguration {
    pub orientation: Orientation,
    pub stabilization: bool,
}

/// An RGB8 video frame. Pixel data is shared between consumers.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, sequence: u64) -> Self {
        Self {
            width,
            height,
            data: Arc::new(data),
            sequence,
            captured_at: Instant::now(),
        }
    }
}

/// Receives fanned-out frames on its own thread.
pub trait FrameConsumer: Send + Sync {
    fn on_frame(&self, frame: &VideoFrame);
}

/// Platform camera. Implementations push frames into the given sink.
pub trait CaptureDevice: Send + Sync {
    fn available_positions(&self) -> Vec<CameraPosition>;

    fn start(&self, position: CameraPosition, sink: FrameSink) -> Result<(), CaptureError>;

    fn stop(&self);

    fn configure(&self, _config: &CaptureConfiguration) {}
}

/// A view or display that can be sampled for screen capture and sharing.
pub trait ScreenSource: Send + Sync {
    fn snapshot(&self) -> Option<VideoFrame>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

// ── Fan-out ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameOrigin {
    Camera,
    Screen,
}

struct ConsumerEntry {
    id: ConsumerId,
    slot: Arc<FrameSlot>,
}

#[derive(Default)]
struct FanOut {
    consumers: Mutex<Vec<ConsumerEntry>>,
    recorder: Mutex<Option<Arc<FrameSlot>>>,
    last_frame: Mutex<Option<VideoFrame>>,
    paused: AtomicBool,
    video_muted: AtomicBool,
    sharing_screen: AtomicBool,
    delivered: AtomicU64,
}

impl FanOut {
    fn deliver(&self, frame: VideoFrame, origin: FrameOrigin) {
        if self.video_muted.load(Ordering::Relaxed) {
            return;
        }
        // Pausing stops the camera only; a shared screen keeps flowing.
        if origin == FrameOrigin::Camera && self.paused.load(Ordering::Relaxed) {
            return;
        }
        // A shared screen replaces camera output for consumers.
        let to_consumers = match origin {
            FrameOrigin::Camera => !self.sharing_screen.load(Ordering::Relaxed),
            FrameOrigin::Screen => true,
        };

        if origin == FrameOrigin::Camera {
            if let Some(slot) = self.recorder.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                slot.put(frame.clone());
            }
            *self.last_frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
        }
        if to_consumers {
            let consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in consumers.iter() {
                if entry.slot.put(frame.clone()) {
                    debug!(consumer = entry.id.0, sequence = frame.sequence, "consumer behind, frame skipped");
                }
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Non-blocking entry point for captured frames.
#[derive(Clone)]
pub struct FrameSink {
    fanout: Arc<FanOut>,
}

impl FrameSink {
    pub fn push(&self, frame: VideoFrame) {
        self.fanout.deliver(frame, FrameOrigin::Camera);
    }
}

// ── Manager ───────────────────────────────────────────────────────────

struct ScreenShare {
    active: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct CaptureState {
    running: bool,
    position: CameraPosition,
    configuration: CaptureConfiguration,
    next_consumer: u64,
    consumer_threads: Vec<(ConsumerId, JoinHandle<()>)>,
    recorder: Option<Recorder>,
    screen_recorder: Option<ScreenRecorder>,
    screen_share: Option<ScreenShare>,
}

struct CaptureInner {
    state: Mutex<CaptureState>,
    fanout: Arc<FanOut>,
    device: Option<Arc<dyn CaptureDevice>>,
    store: ContentStore,
    config: CoreConfig,
    audio_muted: AtomicBool,
}

#[derive(Clone)]
pub struct CaptureSessionManager {
    inner: Arc<CaptureInner>,
}

impl CaptureSessionManager {
    pub fn new(device: Option<Arc<dyn CaptureDevice>>, store: ContentStore, config: CoreConfig) -> Self {
        let position = device
            .as_ref()
            .and_then(|d| {
                let available = d.available_positions();
                [CameraPosition::Front, CameraPosition::Rear]
                    .into_iter()
                    .find(|p| available.contains(p))
            })
            .unwrap_or(CameraPosition::Unspecified);
        Self {
            inner: Arc::new(CaptureInner {
                state: Mutex::new(CaptureState {
                    running: false,
                    position,
                    configuration: CaptureConfiguration::default(),
                    next_consumer: 1,
                    consumer_threads: Vec::new(),
                    recorder: None,
                    screen_recorder: None,
                    screen_share: None,
                }),
                fanout: Arc::new(FanOut::default()),
                device,
                store,
                config,
                audio_muted: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sink for hosts that feed frames themselves (`use_external_video_capture`).
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            fanout: self.inner.fanout.clone(),
        }
    }

    // ── Consumers ─────────────────────────────────────────────────────

    /// Register a consumer. `None` when both slots are taken.
    pub fn add_frame_consumer(&self, consumer: Arc<dyn FrameConsumer>) -> Option<ConsumerId> {
        let id = {
            let mut st = self.state();
            let mut consumers = self
                .inner
                .fanout
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if consumers.len() >= MAX_CONSUMERS {
                warn!("frame consumer rejected, {MAX_CONSUMERS} already registered");
                return None;
            }
            let id = ConsumerId(st.next_consumer);
            st.next_consumer += 1;

            let slot = Arc::new(FrameSlot::new(Arc::new(AtomicBool::new(true))));
            let worker_slot = slot.clone();
            let thread = std::thread::Builder::new()
                .name(format!("frame-consumer-{}", id.0))
                .spawn(move || {
                    while let Some(frame) = worker_slot.take() {
                        consumer.on_frame(&frame);
                    }
                });
            match thread {
                Ok(handle) => st.consumer_threads.push((id, handle)),
                Err(e) => {
                    warn!("failed to spawn consumer thread: {e}");
                    return None;
                }
            }
            consumers.push(ConsumerEntry { id, slot });
            id
        };
        info!(consumer = id.0, "frame consumer added");

        if !self.inner.config.use_external_video_capture && !self.is_running() {
            if let Err(e) = self.start_capture() {
                warn!("lazy capture start failed: {e}");
            }
        }
        Some(id)
    }

    /// Unregister a consumer. Capture keeps running.
    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        let removed = {
            let mut consumers = self
                .inner
                .fanout
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let before = consumers.len();
            consumers.retain(|c| {
                if c.id == id {
                    c.slot.close();
                    false
                } else {
                    true
                }
            });
            consumers.len() != before
        };
        if removed {
            // The worker exits on its own once the slot is closed.
            self.state().consumer_threads.retain(|(cid, _)| *cid != id);
            info!(consumer = id.0, "frame consumer removed");
        }
        removed
    }

    /// Unregister a consumer and stop capture once none remain.
    pub fn stop_capture_for_consumer(&self, id: ConsumerId) -> bool {
        let removed = self.remove_consumer(id);
        if removed && self.consumer_count() == 0 {
            self.halt_device();
        }
        removed
    }

    pub fn consumer_count(&self) -> usize {
        self.inner
            .fanout
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Frames skipped for slow consumers, summed over current consumers.
    pub fn skipped_frames(&self) -> u64 {
        self.inner
            .fanout
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.slot.skipped())
            .sum()
    }

    // ── Session ───────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Start the camera. Idempotent.
    pub fn start_capture(&self) -> Result<(), CaptureError> {
        let mut st = self.state();
        if st.running {
            return Ok(());
        }
        if self.inner.config.use_external_video_capture {
            st.running = true;
            info!("capture session started (external frames)");
            return Ok(());
        }
        let device = self
            .inner
            .device
            .clone()
            .ok_or_else(|| CaptureError::Device("no capture device".into()))?;
        device.configure(&st.configuration);
        if st.position != CameraPosition::Unspecified {
            device.start(st.position, self.frame_sink())?;
        }
        st.running = true;
        info!(position = ?st.position, "capture session started");
        Ok(())
    }

    /// Stop the camera and drop every consumer.
    pub fn stop_capture(&self) {
        let entries: Vec<ConsumerEntry> = std::mem::take(
            &mut *self
                .inner
                .fanout
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for entry in &entries {
            entry.slot.close();
        }
        self.state().consumer_threads.clear();
        self.halt_device();
    }

    fn halt_device(&self) {
        let mut st = self.state();
        if !st.running {
            return;
        }
        st.running = false;
        drop(st);
        if let Some(device) = &self.inner.device {
            device.stop();
        }
        info!("capture session stopped");
    }

    // ── Camera ────────────────────────────────────────────────────────

    pub fn camera_position(&self) -> CameraPosition {
        self.state().position
    }

    fn has_position(&self, position: CameraPosition) -> bool {
        self.inner
            .device
            .as_ref()
            .is_some_and(|d| d.available_positions().contains(&position))
    }

    pub fn has_front_camera(&self) -> bool {
        self.has_position(CameraPosition::Front)
    }

    pub fn has_rear_camera(&self) -> bool {
        self.has_position(CameraPosition::Rear)
    }

    /// Switch cameras. An unspecified or unavailable position pauses output
    /// and yields `Unspecified`; switching back to a real camera resumes.
    pub fn switch_camera(&self, position: CameraPosition) -> CameraPosition {
        let fanout = &self.inner.fanout;
        if position == CameraPosition::Unspecified || !self.has_position(position) {
            fanout.paused.store(true, Ordering::Relaxed);
            info!(requested = ?position, "camera output paused");
            return CameraPosition::Unspecified;
        }

        let mut st = self.state();
        let changed = st.position != position;
        st.position = position;
        let restart = st.running && changed && !self.inner.config.use_external_video_capture;
        drop(st);

        if restart {
            if let Some(device) = &self.inner.device {
                device.stop();
                if let Err(e) = device.start(position, self.frame_sink()) {
                    warn!(?position, "camera restart failed: {e}");
                    fanout.paused.store(true, Ordering::Relaxed);
                    return CameraPosition::Unspecified;
                }
            }
        }
        fanout.paused.store(false, Ordering::Relaxed);
        info!(?position, "camera switched");
        position
    }

    pub fn is_output_paused(&self) -> bool {
        self.inner.fanout.paused.load(Ordering::Relaxed)
    }

    pub fn set_video_muted(&self, muted: bool) {
        self.inner.fanout.video_muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_video_muted(&self) -> bool {
        self.inner.fanout.video_muted.load(Ordering::Relaxed)
    }

    pub fn set_audio_muted(&self, muted: bool) {
        self.inner.audio_muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_audio_muted(&self) -> bool {
        self.inner.audio_muted.load(Ordering::Relaxed)
    }

    pub fn configure(&self, orientation: Orientation, stabilization: bool) {
        let config = CaptureConfiguration {
            orientation,
            stabilization,
        };
        self.state().configuration = config;
        if let Some(device) = &self.inner.device {
            device.configure(&config);
        }
    }

    pub fn configuration(&self) -> CaptureConfiguration {
        self.state().configuration
    }

    /// JPEG of the most recent camera frame.
    pub fn capture_preview_image(&self) -> Pending<Result<Vec<u8>, CaptureError>> {
        let frame = self
            .inner
            .fanout
            .last_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(frame) = frame else {
            return Pending::ready(Err(CaptureError::NoFrame));
        };
        let quality = self.inner.config.jpeg_quality;
        Pending::spawn(async move {
            tokio::task::spawn_blocking(move || recording::encode_jpeg(&frame, quality))
                .await
                .unwrap_or_else(|e| Err(CaptureError::Encode(e.to_string())))
        })
    }

    /// Feed microphone PCM to running recording sub-sessions.
    pub fn push_audio(&self, samples: &[i16]) {
        if self.is_audio_muted() {
            return;
        }
        let st = self.state();
        let buffers = st
            .recorder
            .as_ref()
            .and_then(Recorder::audio)
            .into_iter()
            .chain(st.screen_recorder.as_ref().and_then(ScreenRecorder::audio));
        for buffer in buffers {
            buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(samples);
        }
    }

    // ── Recording ─────────────────────────────────────────────────────

    pub fn start_recording(&self, with_audio: bool) -> Result<(), CaptureError> {
        let mut st = self.state();
        if st.recorder.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let recorder = Recorder::start(
            self.inner.config.preview_fps,
            self.inner.config.jpeg_quality,
            with_audio,
        )?;
        *self
            .inner
            .fanout
            .recorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(recorder.slot().clone());
        st.recorder = Some(recorder);
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.state().recorder.is_some()
    }

    /// Stop recording and store the result. Resolves with its media key.
    pub fn stop_recording(&self) -> Pending<Result<MediaKey, CaptureError>> {
        let Some(recorder) = self.state().recorder.take() else {
            return Pending::ready(Err(CaptureError::NoActiveSession));
        };
        self.inner
            .fanout
            .recorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let store = self.inner.store.clone();
        Pending::spawn(async move { store_container(store, move || recorder.finish()).await })
    }

    // ── Screen capture and sharing ────────────────────────────────────

    /// Record `source` at the fixed screen-capture rate.
    pub fn start_screen_capture(
        &self,
        source: Arc<dyn ScreenSource>,
        with_audio: bool,
    ) -> Result<(), CaptureError> {
        let mut st = self.state();
        if st.screen_recorder.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        st.screen_recorder = Some(ScreenRecorder::start(
            source,
            self.inner.config.screen_capture_fps,
            self.inner.config.jpeg_quality,
            with_audio,
        )?);
        Ok(())
    }

    pub fn stop_screen_capture(&self) -> Pending<Result<MediaKey, CaptureError>> {
        let Some(recorder) = self.state().screen_recorder.take() else {
            return Pending::ready(Err(CaptureError::NoActiveSession));
        };
        let store = self.inner.store.clone();
        Pending::spawn(async move { store_container(store, move || recorder.finish()).await })
    }

    /// Send `source` to consumers in place of the camera.
    pub fn start_screen_share(&self, source: Arc<dyn ScreenSource>) -> Result<(), CaptureError> {
        let mut st = self.state();
        if st.screen_share.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let fanout = self.inner.fanout.clone();
        let interval = recording::frame_interval(self.inner.config.screen_capture_fps);
        let thread = std::thread::Builder::new()
            .name("screen-share".into())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    if let Some(frame) = source.snapshot() {
                        fanout.deliver(frame, FrameOrigin::Screen);
                    }
                    std::thread::sleep(interval);
                }
            })
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        self.inner.fanout.sharing_screen.store(true, Ordering::Relaxed);
        st.screen_share = Some(ScreenShare { active, thread });
        info!("screen share started");
        Ok(())
    }

    pub fn stop_screen_share(&self) {
        let Some(share) = self.state().screen_share.take() else {
            return;
        };
        share.active.store(false, Ordering::Relaxed);
        self.inner.fanout.sharing_screen.store(false, Ordering::Relaxed);
        // The thread exits after its current sleep.
        drop(share.thread);
        info!("screen share stopped");
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.state().screen_share.is_some()
    }

    /// Tear down every sub-session and the camera.
    pub(crate) fn shutdown(&self) {
        self.stop_screen_share();
        let (recorder, screen) = {
            let mut st = self.state();
            (st.recorder.take(), st.screen_recorder.take())
        };
        self.inner
            .fanout
            .recorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(r) = recorder {
            let _ = r.finish();
        }
        if let Some(s) = screen {
            let _ = s.finish();
        }
        self.stop_capture();
    }
}

async fn store_container<F>(store: ContentStore, finish: F) -> Result<MediaKey, CaptureError>
where
    F: FnOnce() -> Result<RecordingContainer, CaptureError> + Send + 'static,
{
    let bytes = tokio::task::spawn_blocking(move || finish()?.to_bytes())
        .await
        .map_err(|e| CaptureError::Encode(e.to_string()))??;
    let (key, _) = store
        .put(MediaType::Video, bytes)
        .map_err(|e| CaptureError::Store(e.to_string()))?;
    if let Err(e) = store.upload(&key).await {
        warn!(media_key = %key, "recording upload failed: {e}");
    }
    info!(media_key = %key, "capture stored");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    struct Counting(AtomicU64);

    impl FrameConsumer for Counting {
        fn on_frame(&self, _frame: &VideoFrame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> CaptureSessionManager {
        let config = CoreConfig {
            use_external_video_capture: true,
            ..Default::default()
        };
        CaptureSessionManager::new(None, ContentStore::new(EventBus::new(), None, None), config)
    }

    #[test]
    fn third_consumer_is_rejected() {
        let mgr = manager();
        let a = mgr.add_frame_consumer(Arc::new(Counting(AtomicU64::new(0))));
        let b = mgr.add_frame_consumer(Arc::new(Counting(AtomicU64::new(0))));
        let c = mgr.add_frame_consumer(Arc::new(Counting(AtomicU64::new(0))));
        assert!(a.is_some() && b.is_some());
        assert!(c.is_none());
        assert_eq!(mgr.consumer_count(), 2);

        assert!(mgr.remove_consumer(a.unwrap()));
        assert!(mgr.add_frame_consumer(Arc::new(Counting(AtomicU64::new(0)))).is_some());
        mgr.stop_capture();
        assert_eq!(mgr.consumer_count(), 0);
    }

    #[test]
    fn preview_without_frames_fails() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = rt.block_on(manager().capture_preview_image()).unwrap();
        assert!(matches!(result, Err(CaptureError::NoFrame)));
    }

    #[test]
    fn switching_to_unspecified_pauses_output() {
        let mgr = manager();
        assert_eq!(mgr.switch_camera(CameraPosition::Unspecified), CameraPosition::Unspecified);
        assert!(mgr.is_output_paused());
    }

    #[tokio::test]
    async fn stop_recording_without_session() {
        let result = manager().stop_recording().await.unwrap();
        assert!(matches!(result, Err(CaptureError::NoActiveSession)));
    }
}
