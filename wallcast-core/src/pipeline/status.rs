use std::sync::Arc;

use dashmap::DashMap;

use crate::models::{DeviceId, ProcessingStatus};

/// Ephemeral `(device, asset) -> ProcessingStatus` map.
///
/// Pipeline workers create and overwrite records; nothing requires one to
/// exist. A missing record reads as ready, so clearing the tracker can never
/// corrupt device or playback state.
#[derive(Clone, Default)]
pub struct StatusTracker {
    statuses: Arc<DashMap<(DeviceId, String), ProcessingStatus>>,
}

impl StatusTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, device_id: &DeviceId, name: &str, status: ProcessingStatus) {
        self.statuses
            .insert((device_id.clone(), name.to_string()), status);
    }

    /// The current status; absent records read as ready.
    #[must_use]
    pub fn get(&self, device_id: &DeviceId, name: &str) -> ProcessingStatus {
        self.statuses
            .get(&(device_id.clone(), name.to_string()))
            .map_or_else(ProcessingStatus::ready, |entry| entry.clone())
    }

    /// Whether a record exists (i.e. a worker has touched this asset).
    #[must_use]
    pub fn contains(&self, device_id: &DeviceId, name: &str) -> bool {
        self.statuses
            .contains_key(&(device_id.clone(), name.to_string()))
    }

    pub fn clear(&self, device_id: &DeviceId, name: &str) {
        self.statuses.remove(&(device_id.clone(), name.to_string()));
    }

    /// Move a record to a new asset name, used when a transcode changes the
    /// container extension.
    pub fn rename(&self, device_id: &DeviceId, from: &str, to: &str) {
        if let Some((_, status)) = self.statuses.remove(&(device_id.clone(), from.to_string())) {
            self.set(device_id, to, status);
        }
    }

    /// Drop every record of a device.
    pub fn clear_device(&self, device_id: &DeviceId) {
        self.statuses.retain(|(owner, _), _| owner != device_id);
    }
}
