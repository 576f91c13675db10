use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extensions probed and transcoded as video streams.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "ogg", "mkv", "mov", "avi"];

/// Audio-only uploads; endpoints play these through the same stream path.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a"];

/// Still-image extensions.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Classification of an asset name into a closed set of playable kinds.
///
/// Derived purely from the storage name: paginated documents keep their
/// extension even after becoming directory-backed, and image folders are the
/// only extensionless assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Image,
    Pdf,
    Pptx,
    ImageFolder,
    Unknown,
}

impl MediaKind {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let Some((stem, ext)) = name.rsplit_once('.') else {
            return Self::ImageFolder;
        };
        if stem.is_empty() {
            return Self::Unknown;
        }
        let ext = ext.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Self::Pdf,
            "pptx" => Self::Pptx,
            _ if IMAGE_EXTENSIONS.contains(&ext.as_str()) => Self::Image,
            _ if VIDEO_EXTENSIONS.contains(&ext.as_str())
                || AUDIO_EXTENSIONS.contains(&ext.as_str()) =>
            {
                Self::Video
            }
            _ => Self::Unknown,
        }
    }

    /// Whether this kind exposes an ordered page sequence.
    #[must_use]
    pub const fn is_paginated(&self) -> bool {
        matches!(self, Self::Pdf | Self::Pptx | Self::ImageFolder)
    }

    #[must_use]
    pub const fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    /// The playback-state kind this classification maps to; `None` for
    /// `Unknown`, which is never playable.
    #[must_use]
    pub const fn playback_kind(&self) -> Option<PlaybackKind> {
        Some(match self {
            Self::Video => PlaybackKind::Video,
            Self::Image => PlaybackKind::Image,
            Self::Pdf | Self::Pptx => PlaybackKind::DocumentPage,
            Self::ImageFolder => PlaybackKind::ImageFolder,
            Self::Unknown => return None,
        })
    }
}

/// What a device is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackKind {
    Idle,
    Video,
    Image,
    DocumentPage,
    ImageFolder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Playing,
    Paused,
    Idle,
}

/// Per-device playback state, exactly one per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackState {
    pub kind: PlaybackKind,
    pub asset: Option<String>,
    pub lifecycle: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::idle()
    }
}

impl PlaybackState {
    #[must_use]
    pub fn idle() -> Self {
        Self {
            kind: PlaybackKind::Idle,
            asset: None,
            lifecycle: Lifecycle::Idle,
            page: None,
            updated_at: Utc::now(),
        }
    }

    /// Begin playing `asset`. Paginated kinds start on page 1. `Unknown`
    /// classifications must be rejected before reaching this point; they
    /// leave the state untouched.
    pub fn start(&mut self, kind: MediaKind, asset: String) {
        let Some(playback) = kind.playback_kind() else {
            return;
        };
        self.kind = playback;
        self.page = kind.is_paginated().then_some(1);
        self.asset = Some(asset);
        self.lifecycle = Lifecycle::Playing;
        self.updated_at = Utc::now();
    }

    pub fn resume(&mut self) {
        self.lifecycle = Lifecycle::Playing;
        self.updated_at = Utc::now();
    }

    pub fn pause(&mut self) {
        self.lifecycle = Lifecycle::Paused;
        self.updated_at = Utc::now();
    }

    pub fn stop(&mut self) {
        *self = Self::idle();
    }

    pub fn set_page(&mut self, page: u32) {
        self.page = Some(page);
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.kind, PlaybackKind::Idle)
    }

    #[must_use]
    pub const fn is_paginated(&self) -> bool {
        matches!(
            self.kind,
            PlaybackKind::DocumentPage | PlaybackKind::ImageFolder
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_closed() {
        assert_eq!(MediaKind::from_name("movie.mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_name("movie.MOV"), MediaKind::Video);
        assert_eq!(MediaKind::from_name("song.mp3"), MediaKind::Video);
        assert_eq!(MediaKind::from_name("photo.jpeg"), MediaKind::Image);
        assert_eq!(MediaKind::from_name("deck.pptx"), MediaKind::Pptx);
        assert_eq!(MediaKind::from_name("doc.pdf"), MediaKind::Pdf);
        assert_eq!(MediaKind::from_name("vacation"), MediaKind::ImageFolder);
        assert_eq!(MediaKind::from_name("archive.xyz"), MediaKind::Unknown);
        assert_eq!(MediaKind::from_name(".hidden"), MediaKind::Unknown);
    }

    #[test]
    fn paginated_kinds() {
        assert!(MediaKind::Pdf.is_paginated());
        assert!(MediaKind::Pptx.is_paginated());
        assert!(MediaKind::ImageFolder.is_paginated());
        assert!(!MediaKind::Video.is_paginated());
        assert!(!MediaKind::Image.is_paginated());
    }

    #[test]
    fn start_sets_page_for_paginated_only() {
        let mut state = PlaybackState::idle();
        state.start(MediaKind::Pdf, "doc.pdf".into());
        assert_eq!(state.page, Some(1));
        assert_eq!(state.kind, PlaybackKind::DocumentPage);
        assert_eq!(state.lifecycle, Lifecycle::Playing);

        state.start(MediaKind::Video, "movie.mp4".into());
        assert_eq!(state.page, None);
        assert_eq!(state.kind, PlaybackKind::Video);
    }

    #[test]
    fn stop_returns_to_idle_from_any_state() {
        let mut state = PlaybackState::idle();
        state.start(MediaKind::Image, "photo.png".into());
        state.pause();
        state.stop();
        assert!(state.is_idle());
        assert_eq!(state.asset, None);
        assert_eq!(state.page, None);
    }
}
