use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::VideoFrame;

/// Single-slot frame buffer between the capture producer and one consumer.
///
/// `put` never blocks: a frame the consumer has not picked up yet is
/// overwritten and counted as skipped.
pub(crate) struct FrameSlot {
    frame: Mutex<Option<VideoFrame>>,
    notify: Condvar,
    active: Arc<AtomicBool>,
    skipped: AtomicU64,
}

impl FrameSlot {
    pub fn new(active: Arc<AtomicBool>) -> Self {
        Self {
            frame: Mutex::new(None),
            notify: Condvar::new(),
            active,
            skipped: AtomicU64::new(0),
        }
    }

    /// Store a new frame. Returns true if an unconsumed frame was dropped.
    pub fn put(&self, frame: VideoFrame) -> bool {
        let mut slot = self.frame.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = slot.replace(frame).is_some();
        self.notify.notify_one();
        if dropped {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
        dropped
    }

    /// Take the current frame, blocking until one is available or the slot
    /// is deactivated. A frame stored before `close` is still handed out.
    pub fn take(&self) -> Option<VideoFrame> {
        let mut slot = self.frame.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(frame) = slot.take() {
                return Some(frame);
            }
            if !self.active.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _) = self
                .notify
                .wait_timeout(slot, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    /// Deactivate and wake the waiting consumer.
    pub fn close(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.notify.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}
