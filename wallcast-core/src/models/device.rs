use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::DeviceId;

/// What an endpoint reports it can render. Everything defaults to enabled;
/// capabilities only narrow what administrators may send to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub video: bool,
    pub audio: bool,
    pub images: bool,
    pub pdf: bool,
    pub pptx: bool,
    pub streaming: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            images: true,
            pdf: true,
            pptx: true,
            streaming: true,
        }
    }
}

/// A registered playback endpoint. Created only by explicit administrative
/// action; the id doubles as the folder name under the storage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Folder name under the storage root holding this device's assets.
    pub root: String,
    pub device_type: Option<String>,
    pub platform: Option<String>,
    pub capabilities: Capabilities,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    #[must_use]
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        let root = id.as_str().to_string();
        Self {
            id,
            name: name.into(),
            root,
            device_type: None,
            platform: None,
            capabilities: Capabilities::default(),
            last_seen: None,
            created_at: Utc::now(),
        }
    }
}
