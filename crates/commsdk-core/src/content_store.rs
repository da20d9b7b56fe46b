//! Content-addressed media store.
//!
//! Keys are derived from the SHA-256 of the stored bytes, so a key can never be
//! reassigned to different content. Blobs live in memory, optionally mirrored
//! to a disk cache, and are fetched from the [`BlobService`] on demand.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use commsdk_protocol::types::{MediaKey, MediaType};

use crate::completion::Pending;
use crate::error::{RetrieveError, TransportError};
use crate::events::{EventBus, Notification};
use crate::transport::BlobService;

struct StoreInner {
    blobs: DashMap<MediaKey, Arc<Vec<u8>>>,
    remote: Option<Arc<dyn BlobService>>,
    cache_dir: Option<PathBuf>,
    events: EventBus,
}

#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<StoreInner>,
}

/// Key for `data` stored as `media_type`.
pub fn key_for(media_type: MediaType, data: &[u8]) -> Option<MediaKey> {
    let digest: [u8; 32] = Sha256::digest(data).into();
    MediaKey::from_digest(media_type, &digest).ok()
}

fn matches_key(key: &MediaKey, data: &[u8]) -> bool {
    key_for(key.media_type(), data).as_ref() == Some(key)
}

impl ContentStore {
    pub fn new(
        events: EventBus,
        remote: Option<Arc<dyn BlobService>>,
        cache_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                blobs: DashMap::new(),
                remote,
                cache_dir,
                events,
            }),
        }
    }

    fn cache_path(&self, key: &MediaKey) -> Option<PathBuf> {
        self.inner
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(key.digest_hex()))
    }

    fn write_cache(&self, key: &MediaKey, data: &[u8]) -> std::io::Result<()> {
        let Some(path) = self.cache_path(key) else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)
    }

    /// Register content. Returns the key and whether it was newly created.
    pub fn put(&self, media_type: MediaType, data: Vec<u8>) -> std::io::Result<(MediaKey, bool)> {
        let key = key_for(media_type, &data).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{media_type:?} content is not stored"),
            )
        })?;
        if self.inner.blobs.contains_key(&key) {
            return Ok((key, false));
        }
        self.write_cache(&key, &data)?;
        let created = self.inner.blobs.insert(key.clone(), Arc::new(data)).is_none();
        debug!(media_key = %key, created, "content registered");
        Ok((key, created))
    }

    /// Local-only existence check.
    pub fn has(&self, key: &MediaKey) -> bool {
        self.inner.blobs.contains_key(key)
            || self.cache_path(key).is_some_and(|p| p.is_file())
    }

    /// Local-only lookup. Disk-cached entries are verified and promoted to memory.
    pub fn get(&self, key: &MediaKey) -> Option<Arc<Vec<u8>>> {
        if let Some(blob) = self.inner.blobs.get(key) {
            return Some(blob.clone());
        }
        let data = std::fs::read(self.cache_path(key)?).ok()?;
        if !matches_key(key, &data) {
            warn!(media_key = %key, "cached content failed integrity check");
            return None;
        }
        let blob = Arc::new(data);
        self.inner.blobs.insert(key.clone(), blob.clone());
        Some(blob)
    }

    /// Cached file path for a key, if the disk cache holds it.
    pub fn media_path_for_key(&self, key: &MediaKey) -> Option<PathBuf> {
        self.cache_path(key).filter(|p| p.is_file())
    }

    /// Remove a key locally. Used to roll back content that never became usable.
    pub fn evict(&self, key: &MediaKey) {
        self.inner.blobs.remove(key);
        if let Some(path) = self.cache_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Push a locally stored blob to the remote service.
    pub async fn upload(&self, key: &MediaKey) -> Result<(), TransportError> {
        let Some(remote) = self.inner.remote.clone() else {
            return Ok(());
        };
        let data = self
            .get(key)
            .ok_or_else(|| TransportError::BlobMissing(key.to_string()))?;
        remote.upload(key, data.as_ref().clone()).await?;
        info!(media_key = %key, bytes = data.len(), "content uploaded");
        Ok(())
    }

    /// Fetch a key, downloading it when absent. Progress is emitted as
    /// `DownloadProgress` notifications keyed by the media key.
    pub async fn fetch(&self, key: &MediaKey) -> Result<Arc<Vec<u8>>, RetrieveError> {
        if let Some(blob) = self.get(key) {
            return Ok(blob);
        }
        let Some(remote) = self.inner.remote.clone() else {
            return Err(RetrieveError::UnknownKey(key.to_string()));
        };

        let events = self.inner.events.clone();
        let last_percent = AtomicI16::new(-1);
        let progress_key = key.clone();
        let progress = move |received: u64, total: u64| {
            let percent = if total == 0 {
                0
            } else {
                (received.min(total) * 100 / total) as i16
            };
            if last_percent.fetch_max(percent, Ordering::Relaxed) < percent {
                events.emit(Notification::DownloadProgress {
                    key: progress_key.clone(),
                    percent: percent as u8,
                });
            }
        };

        let data = match remote.download(key, &progress).await {
            Ok(data) => data,
            Err(TransportError::BlobMissing(_)) => {
                return Err(RetrieveError::UnknownKey(key.to_string()))
            }
            Err(e) => {
                warn!(media_key = %key, "download failed: {e}");
                return Err(RetrieveError::DownloadFailed(e.to_string()));
            }
        };

        if !matches_key(key, &data) {
            warn!(media_key = %key, "downloaded content failed integrity check");
            return Err(RetrieveError::IntegrityMismatch(key.to_string()));
        }
        // Completion always follows a final 100%.
        progress(1, 1);

        if let Err(e) = self.write_cache(key, &data) {
            warn!(media_key = %key, "failed to cache downloaded content: {e}");
        }
        let blob = Arc::new(data);
        self.inner.blobs.insert(key.clone(), blob.clone());
        Ok(blob)
    }

    /// Asynchronous retrieval whose completion fires exactly once.
    pub fn retrieve(&self, key: &MediaKey) -> Pending<Result<Arc<Vec<u8>>, RetrieveError>> {
        if let Some(blob) = self.get(key) {
            return Pending::ready(Ok(blob));
        }
        let store = self.clone();
        let key = key.clone();
        Pending::spawn(async move { store.fetch(&key).await })
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.inner.cache_dir.as_deref()
    }
}
