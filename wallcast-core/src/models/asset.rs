use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::DeviceId;

/// Media attributes recovered by probing, or copied from a dedup match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub video_profile: Option<String>,
    pub video_bitrate: Option<u64>,
    pub audio_codec: Option<String>,
    pub audio_bitrate: Option<u64>,
    pub audio_channels: Option<u32>,
}

/// One stored content item owned by a device.
///
/// `name` is the safe storage name and the key within the device; `path` is
/// where the bytes physically live, which may be inside another device's root
/// when deduplication shares storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub device_id: DeviceId,
    pub name: String,
    pub original_name: String,
    pub content_hash: Option<String>,
    pub partial_hash: Option<String>,
    pub size: u64,
    pub mime: String,
    pub media: Option<MediaInfo>,
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub is_placeholder: bool,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        name: impl Into<String>,
        original_name: impl Into<String>,
        path: PathBuf,
        size: u64,
    ) -> Self {
        let name = name.into();
        let mime = mime_for_name(&name).to_string();
        Self {
            device_id,
            name,
            original_name: original_name.into(),
            content_hash: None,
            partial_hash: None,
            size,
            mime,
            media: None,
            path,
            modified_at: Utc::now(),
            is_placeholder: false,
            created_at: Utc::now(),
        }
    }
}

/// MIME type for a storage name, by extension. Extensionless names are
/// directory-backed image folders.
#[must_use]
pub fn mime_for_name(name: &str) -> &'static str {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return "inode/directory";
    };
    match ext.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "ogg" => "video/ogg",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
