//! Content normalization before registration in the content store.
//!
//! Images are downscaled and re-encoded as JPEG. Video is checked for a known
//! container and a size bound; re-encoding is delegated to a
//! [`MediaTranscoder`]. Everything else passes through.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::debug;

use commsdk_protocol::types::MediaType;

use crate::config::{CoreConfig, ImageLimits};
use crate::error::SubmitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl ImageQuality {
    pub fn max_dimension(self, limits: &ImageLimits) -> u32 {
        match self {
            Self::Low => limits.low,
            Self::Medium => limits.medium,
            Self::High => limits.high,
        }
    }
}

/// Re-encodes video into the supported format.
pub trait MediaTranscoder: Send + Sync {
    fn transcode_video(&self, data: Vec<u8>) -> Result<Vec<u8>, SubmitError>;
}

/// Accepts already-supported video unchanged.
pub struct PassthroughTranscoder;

impl MediaTranscoder for PassthroughTranscoder {
    fn transcode_video(&self, data: Vec<u8>) -> Result<Vec<u8>, SubmitError> {
        Ok(data)
    }
}

/// Decode, downscale so the longest side fits `max_dimension`, re-encode JPEG.
pub fn normalize_image(data: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>, SubmitError> {
    let img = image::load_from_memory(data).map_err(|e| SubmitError::Transcode(e.to_string()))?;
    let (w, h) = (img.width(), img.height());
    let img = if w.max(h) > max_dimension {
        debug!(from_w = w, from_h = h, max_dimension, "downscaling image");
        img.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        img
    };

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    img.to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| SubmitError::Transcode(e.to_string()))?;
    Ok(out)
}

/// ISO-BMFF / QuickTime container check on the first box type.
pub fn is_supported_video(data: &[u8]) -> bool {
    data.len() >= 8 && matches!(&data[4..8], b"ftyp" | b"moov" | b"mdat" | b"wide" | b"free")
}

pub fn normalize_video(
    data: Vec<u8>,
    max_bytes: u64,
    transcoder: &dyn MediaTranscoder,
) -> Result<Vec<u8>, SubmitError> {
    if !is_supported_video(&data) {
        return Err(SubmitError::Transcode("unrecognized video container".into()));
    }
    let out = transcoder.transcode_video(data)?;
    if out.len() as u64 > max_bytes {
        return Err(SubmitError::Transcode(format!(
            "video is {} bytes, limit {max_bytes}",
            out.len()
        )));
    }
    Ok(out)
}

/// Normalize content for its declared type.
pub fn normalize(
    media_type: MediaType,
    data: Vec<u8>,
    quality: ImageQuality,
    config: &CoreConfig,
    transcoder: &dyn MediaTranscoder,
) -> Result<Vec<u8>, SubmitError> {
    match media_type {
        MediaType::Image | MediaType::UserImage => normalize_image(
            &data,
            quality.max_dimension(&config.image_limits),
            config.jpeg_quality,
        ),
        MediaType::Video => normalize_video(data, config.max_video_bytes, transcoder),
        MediaType::Text => Err(SubmitError::Transcode("text is not rich media".into())),
        _ => Ok(data),
    }
}
