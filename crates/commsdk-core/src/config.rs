use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Longest-side limits applied when normalizing images, per quality level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLimits {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            low: 640,
            medium: 1280,
            high: 1920,
        }
    }
}

/// SDK configuration, saved as `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Routes push credentials to the sandbox and unlocks test-only offers.
    pub sandbox_mode: bool,
    pub use_application_badge: bool,
    pub prefer_message_encryption: bool,

    // Calls
    pub hangup_on_connection_timeout: bool,
    pub connection_timeout_secs: u64,
    pub video_stall_timeout_secs: u64,
    pub connection_stall_timeout_secs: u64,

    // Background
    pub keepalive_interval_secs: u64,
    pub full_sync_interval_secs: u64,

    // Capture
    pub use_external_video_capture: bool,
    pub preview_fps: u32,
    pub screen_capture_fps: u32,

    // Media normalization
    pub image_limits: ImageLimits,
    pub jpeg_quality: u8,
    pub max_video_bytes: u64,

    /// Media cache and encrypted key store live here. None = memory only.
    pub data_dir: Option<PathBuf>,
    /// `host:port` used by the TLS transport.
    pub server_address: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sandbox_mode: false,
            use_application_badge: true,
            prefer_message_encryption: false,
            hangup_on_connection_timeout: false,
            connection_timeout_secs: 30,
            video_stall_timeout_secs: 3,
            connection_stall_timeout_secs: 3,
            keepalive_interval_secs: 600,
            full_sync_interval_secs: 3600,
            use_external_video_capture: false,
            preview_fps: 15,
            screen_capture_fps: 10,
            image_limits: ImageLimits::default(),
            jpeg_quality: 80,
            max_video_bytes: 25 * 1024 * 1024,
            data_dir: None,
            server_address: None,
        }
    }
}

impl CoreConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_secs)
    }

    pub fn media_cache_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("media"))
    }

    pub fn keystore_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("keystore.bin"))
    }
}

/// Load config from disk, falling back to defaults if missing or corrupt.
pub fn load_config(path: &Path) -> CoreConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                CoreConfig::default()
            }
        },
        Err(_) => CoreConfig::default(),
    }
}

/// Save config to disk atomically (write to .tmp, then rename).
pub fn save_config(path: &Path, config: &CoreConfig) -> Result<(), CoreError> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
