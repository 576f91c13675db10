use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::id::DeviceId;
use crate::models::playback::PlaybackState;

/// Why a registration attempt was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownDevice,
}

/// Events pushed to sessions and observers.
///
/// Device-scoped commands fan out only to the sessions of one device; content
/// and presence changes go to global observers. The hub decides the fan-out,
/// the event carries the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// A device's session set went 0→1.
    DeviceOnline {
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
    },

    /// A device's session set went 1→0.
    DeviceOffline {
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
    },

    /// Snapshot of currently online devices, sent to a session on subscribe.
    OnlineSnapshot {
        devices: Vec<DeviceId>,
        timestamp: DateTime<Utc>,
    },

    /// Registration accepted; carries the device's current playback state.
    Registered {
        device_id: DeviceId,
        state: PlaybackState,
        timestamp: DateTime<Utc>,
    },

    /// Registration turned down.
    Rejected {
        reason: RejectReason,
        timestamp: DateTime<Utc>,
    },

    /// Start or re-broadcast playback of the state's asset.
    Play {
        device_id: DeviceId,
        state: PlaybackState,
        timestamp: DateTime<Utc>,
    },

    Pause {
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
    },

    Restart {
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
    },

    Stop {
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
    },

    /// Resume hint when the server has no current-asset state to re-send.
    Resume {
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
    },

    PageChanged {
        device_id: DeviceId,
        page: u32,
        timestamp: DateTime<Utc>,
    },

    ProcessingStarted {
        device_id: DeviceId,
        file: String,
        timestamp: DateTime<Utc>,
    },

    ProcessingProgress {
        device_id: DeviceId,
        file: String,
        progress: u8,
        timestamp: DateTime<Utc>,
    },

    /// Pipeline finished with an asset; `pages` is set for converted
    /// documents.
    FileReady {
        device_id: DeviceId,
        file: String,
        pages: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    FileError {
        device_id: DeviceId,
        file: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Best-effort global signal that device content changed.
    DevicesChanged { timestamp: DateTime<Utc> },
}

impl DeviceEvent {
    /// The device this event concerns, if any.
    #[must_use]
    pub const fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::DeviceOnline { device_id, .. }
            | Self::DeviceOffline { device_id, .. }
            | Self::Registered { device_id, .. }
            | Self::Play { device_id, .. }
            | Self::Pause { device_id, .. }
            | Self::Restart { device_id, .. }
            | Self::Stop { device_id, .. }
            | Self::Resume { device_id, .. }
            | Self::PageChanged { device_id, .. }
            | Self::ProcessingStarted { device_id, .. }
            | Self::ProcessingProgress { device_id, .. }
            | Self::FileReady { device_id, .. }
            | Self::FileError { device_id, .. } => Some(device_id),
            Self::OnlineSnapshot { .. } | Self::Rejected { .. } | Self::DevicesChanged { .. } => {
                None
            }
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::DeviceOnline { timestamp, .. }
            | Self::DeviceOffline { timestamp, .. }
            | Self::OnlineSnapshot { timestamp, .. }
            | Self::Registered { timestamp, .. }
            | Self::Rejected { timestamp, .. }
            | Self::Play { timestamp, .. }
            | Self::Pause { timestamp, .. }
            | Self::Restart { timestamp, .. }
            | Self::Stop { timestamp, .. }
            | Self::Resume { timestamp, .. }
            | Self::PageChanged { timestamp, .. }
            | Self::ProcessingStarted { timestamp, .. }
            | Self::ProcessingProgress { timestamp, .. }
            | Self::FileReady { timestamp, .. }
            | Self::FileError { timestamp, .. }
            | Self::DevicesChanged { timestamp } => timestamp,
        }
    }

    /// Get a short description of the event type
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::DeviceOnline { .. } => "device_online",
            Self::DeviceOffline { .. } => "device_offline",
            Self::OnlineSnapshot { .. } => "online_snapshot",
            Self::Registered { .. } => "registered",
            Self::Rejected { .. } => "rejected",
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Restart { .. } => "restart",
            Self::Stop { .. } => "stop",
            Self::Resume { .. } => "resume",
            Self::PageChanged { .. } => "page_changed",
            Self::ProcessingStarted { .. } => "processing_started",
            Self::ProcessingProgress { .. } => "processing_progress",
            Self::FileReady { .. } => "file_ready",
            Self::FileError { .. } => "file_error",
            Self::DevicesChanged { .. } => "devices_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_round_trip() {
        let event = DeviceEvent::PageChanged {
            device_id: DeviceId::from_string("tv1".to_string()),
            page: 3,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("page_changed"));
        assert!(json.contains("tv1"));

        let deserialized: DeviceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "page_changed");
        assert_eq!(deserialized.device_id().unwrap().as_str(), "tv1");
    }

    #[test]
    fn global_events_carry_no_device() {
        let event = DeviceEvent::DevicesChanged {
            timestamp: Utc::now(),
        };
        assert!(event.device_id().is_none());
        assert_eq!(event.event_type(), "devices_changed");
    }

    #[test]
    fn reject_reason_serializes_snake_case() {
        let event = DeviceEvent::Rejected {
            reason: RejectReason::UnknownDevice,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("unknown_device"));
    }
}
