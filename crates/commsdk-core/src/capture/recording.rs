//! Recording and screen-capture sub-sessions.
//!
//! Both produce a motion-JPEG [`RecordingContainer`] that is stored as `video`
//! media when the sub-session stops. Encoding runs on the sub-session's own
//! thread, never on the capture producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::slot::FrameSlot;
use super::{ScreenSource, VideoFrame};
use crate::error::CaptureError;

/// Motion-JPEG sequence with optional PCM audio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingContainer {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub frames: Vec<Vec<u8>>,
    pub sample_rate: u32,
    /// Interleaved mono i16 PCM, in arrival order.
    pub audio: Vec<i16>,
}

impl RecordingContainer {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CaptureError> {
        postcard::to_allocvec(self).map_err(|e| CaptureError::Encode(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CaptureError> {
        postcard::from_bytes(data).map_err(|e| CaptureError::Encode(e.to_string()))
    }

    fn push_frame(&mut self, frame: &VideoFrame, quality: u8) {
        match encode_jpeg(frame, quality) {
            Ok(jpeg) => {
                self.width = frame.width;
                self.height = frame.height;
                self.frames.push(jpeg);
            }
            Err(e) => debug!("dropping frame {}: {e}", frame.sequence),
        }
    }
}

/// Encode an RGB8 frame as JPEG.
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.data.as_ref().clone())
        .ok_or_else(|| CaptureError::Encode("frame size does not match dimensions".into()))?;
    let mut out = Vec::new();
    img.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)))
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
    Ok(out)
}

/// Audio captured alongside a sub-session, when enabled.
pub(crate) type AudioBuffer = Arc<Mutex<Vec<i16>>>;

fn drain_audio(audio: &Option<AudioBuffer>) -> Vec<i16> {
    audio
        .as_ref()
        .map(|a| std::mem::take(&mut *a.lock().unwrap_or_else(PoisonError::into_inner)))
        .unwrap_or_default()
}

// ── Recording (camera feed) ───────────────────────────────────────────

/// Records the live camera feed from its own frame slot.
pub(crate) struct Recorder {
    slot: Arc<FrameSlot>,
    audio: Option<AudioBuffer>,
    thread: JoinHandle<RecordingContainer>,
}

impl Recorder {
    pub fn start(fps: u32, quality: u8, with_audio: bool) -> Result<Self, CaptureError> {
        let slot = Arc::new(FrameSlot::new(Arc::new(AtomicBool::new(true))));
        let worker_slot = slot.clone();
        let thread = std::thread::Builder::new()
            .name("recording".into())
            .spawn(move || {
                let mut container = RecordingContainer {
                    fps,
                    ..Default::default()
                };
                while let Some(frame) = worker_slot.take() {
                    container.push_frame(&frame, quality);
                }
                container
            })
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        info!(fps, with_audio, "recording started");
        Ok(Self {
            slot,
            audio: with_audio.then(AudioBuffer::default),
            thread,
        })
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn audio(&self) -> Option<&AudioBuffer> {
        self.audio.as_ref()
    }

    /// Stop and collect the container. Blocks until the worker exits.
    pub fn finish(self) -> Result<RecordingContainer, CaptureError> {
        self.slot.close();
        let mut container = self
            .thread
            .join()
            .map_err(|_| CaptureError::Encode("recording thread panicked".into()))?;
        container.audio = drain_audio(&self.audio);
        if !container.audio.is_empty() {
            container.sample_rate = super::AUDIO_SAMPLE_RATE;
        }
        info!(frames = container.frames.len(), "recording stopped");
        Ok(container)
    }
}

// ── Screen capture ────────────────────────────────────────────────────

/// Samples a screen source at a fixed rate into a container.
pub(crate) struct ScreenRecorder {
    active: Arc<AtomicBool>,
    audio: Option<AudioBuffer>,
    thread: JoinHandle<RecordingContainer>,
}

impl ScreenRecorder {
    pub fn start(
        source: Arc<dyn ScreenSource>,
        fps: u32,
        quality: u8,
        with_audio: bool,
    ) -> Result<Self, CaptureError> {
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let interval = frame_interval(fps);
        let thread = std::thread::Builder::new()
            .name("screen-capture".into())
            .spawn(move || {
                let mut container = RecordingContainer {
                    fps,
                    ..Default::default()
                };
                let mut next = Instant::now();
                while flag.load(Ordering::Relaxed) {
                    match source.snapshot() {
                        Some(frame) => container.push_frame(&frame, quality),
                        None => debug!("screen source returned no frame"),
                    }
                    next += interval;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        std::thread::sleep(wait);
                    } else {
                        // Fell behind; resync instead of bursting.
                        next = Instant::now();
                    }
                }
                container
            })
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        info!(fps, with_audio, "screen capture started");
        Ok(Self {
            active,
            audio: with_audio.then(AudioBuffer::default),
            thread,
        })
    }

    pub fn audio(&self) -> Option<&AudioBuffer> {
        self.audio.as_ref()
    }

    pub fn finish(self) -> Result<RecordingContainer, CaptureError> {
        self.active.store(false, Ordering::Relaxed);
        let mut container = self
            .thread
            .join()
            .map_err(|_| CaptureError::Encode("screen capture thread panicked".into()))?;
        container.audio = drain_audio(&self.audio);
        if !container.audio.is_empty() {
            container.sample_rate = super::AUDIO_SAMPLE_RATE;
        }
        if container.frames.is_empty() {
            warn!("screen capture stopped without frames");
        }
        info!(frames = container.frames.len(), "screen capture stopped");
        Ok(container)
    }
}

pub(crate) fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(fps.max(1)))
}
