use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    Checking,
    Processing,
    Ready,
    Error,
}

/// Advisory processing status for one (device, asset) pair.
///
/// Absence of a record means the asset is ready; records are additive and can
/// be cleared at any time without corrupting device or playback state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub phase: ProcessingPhase,
    /// 0..=100
    pub progress: u8,
    /// Whether the asset is playable right now (the original remains playable
    /// while augmentation runs or after it fails).
    pub can_play: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingStatus {
    #[must_use]
    pub const fn ready() -> Self {
        Self {
            phase: ProcessingPhase::Ready,
            progress: 100,
            can_play: true,
            error: None,
        }
    }

    #[must_use]
    pub const fn checking() -> Self {
        Self {
            phase: ProcessingPhase::Checking,
            progress: 0,
            can_play: true,
            error: None,
        }
    }

    #[must_use]
    pub const fn processing(progress: u8, can_play: bool) -> Self {
        Self {
            phase: ProcessingPhase::Processing,
            progress,
            can_play,
            error: None,
        }
    }

    #[must_use]
    pub fn error(reason: impl Into<String>, can_play: bool) -> Self {
        Self {
            phase: ProcessingPhase::Error,
            progress: 0,
            can_play,
            error: Some(reason.into()),
        }
    }
}

impl Default for ProcessingStatus {
    fn default() -> Self {
        Self::ready()
    }
}
