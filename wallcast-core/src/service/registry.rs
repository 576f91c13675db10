//! Durable device records, per-device playback state, and asset bookkeeping.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::models::{
    Asset, Capabilities, Device, DeviceId, MediaKind, PlaybackState, ProcessingStatus,
};
use crate::pipeline::status::StatusTracker;
use crate::repository::{AssetStore, DeviceStore};
use crate::validation::safe_filename;
use crate::{Error, Result};

/// Registry owning device records, their playback state, and their assets.
///
/// Cheap to clone; all state lives behind `Arc`. Playback state is kept in
/// memory (one entry per device) because it is ephemeral by design: a restart
/// returns every device to idle.
#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<dyn DeviceStore>,
    assets: Arc<dyn AssetStore>,
    playback: Arc<DashMap<DeviceId, PlaybackState>>,
    status: StatusTracker,
    storage_root: PathBuf,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        assets: Arc<dyn AssetStore>,
        status: StatusTracker,
        storage_root: PathBuf,
    ) -> Self {
        Self {
            devices,
            assets,
            playback: Arc::new(DashMap::new()),
            status,
            storage_root,
        }
    }

    #[must_use]
    pub fn storage_root(&self) -> &std::path::Path {
        &self.storage_root
    }

    #[must_use]
    pub fn asset_store(&self) -> Arc<dyn AssetStore> {
        self.assets.clone()
    }

    #[must_use]
    pub fn status_tracker(&self) -> StatusTracker {
        self.status.clone()
    }

    /// The directory holding a device's assets.
    #[must_use]
    pub fn device_dir(&self, device: &Device) -> PathBuf {
        self.storage_root.join(&device.root)
    }

    /// Create a device by explicit administrative action. The id doubles as
    /// the device's directory name, so it must pass the charset check.
    pub async fn create_device(&self, id: &str, name: &str) -> Result<Device> {
        let device_id = DeviceId::parse(id)?;
        let device = self.devices.insert(Device::new(device_id, name)).await?;
        fs::create_dir_all(self.device_dir(&device)).await?;
        self.playback.insert(device.id.clone(), PlaybackState::idle());
        info!(device_id = %device.id.as_str(), "device created");
        Ok(device)
    }

    pub async fn get_device(&self, id: &DeviceId) -> Result<Device> {
        self.devices.get(id).await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        self.devices.list().await
    }

    /// Refresh registration metadata: last-seen, reported type/platform, and
    /// the capability set.
    pub async fn touch_registration(
        &self,
        id: &DeviceId,
        device_type: Option<String>,
        platform: Option<String>,
        capabilities: Option<Capabilities>,
    ) -> Result<Device> {
        let mut device = self.devices.get(id).await?;
        device.last_seen = Some(chrono::Utc::now());
        if device_type.is_some() {
            device.device_type = device_type;
        }
        if platform.is_some() {
            device.platform = platform;
        }
        if let Some(caps) = capabilities {
            device.capabilities = caps;
        }
        self.devices.update(device).await
    }

    /// Delete a device, cascading its asset records, processing statuses, and
    /// playback state. Bytes referenced by other devices survive.
    pub async fn delete_device(&self, id: &DeviceId) -> Result<()> {
        let device = self.devices.get(id).await?;
        let dir = self.device_dir(&device);

        let removed = self.assets.remove_device(id).await?;
        for asset in &removed {
            // Bytes outside this device's directory are shared; delete them
            // only when the last referrer is gone.
            if !asset.path.starts_with(&dir)
                && self.assets.path_referrers(&asset.path).await? == 0
            {
                remove_bytes(&asset.path).await;
            }
        }

        self.playback.remove(id);
        self.status.clear_device(id);

        if self.assets.any_path_under(&dir, id).await? {
            warn!(
                device_id = %id.as_str(),
                "device directory kept: another device references bytes inside it"
            );
        } else if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        self.devices.remove(id).await?;
        info!(device_id = %id.as_str(), assets = removed.len(), "device deleted");
        Ok(())
    }

    /// Current playback state; devices start idle.
    pub async fn playback_state(&self, id: &DeviceId) -> Result<PlaybackState> {
        self.devices.get(id).await?;
        Ok(self.playback.entry(id.clone()).or_default().clone())
    }

    /// Mutate a device's playback state and return the result. State for a
    /// device is only ever touched by that device's own handlers, so the
    /// entry guard is held briefly and never across awaits.
    pub async fn update_playback<F>(&self, id: &DeviceId, mutate: F) -> Result<PlaybackState>
    where
        F: FnOnce(&mut PlaybackState),
    {
        self.devices.get(id).await?;
        let mut entry = self.playback.entry(id.clone()).or_default();
        mutate(entry.value_mut());
        Ok(entry.clone())
    }

    pub async fn reset_playback(&self, id: &DeviceId) -> Result<PlaybackState> {
        self.update_playback(id, PlaybackState::stop).await
    }

    /// Asset records joined with live processing status; absent status reads
    /// as ready.
    pub async fn list_assets(&self, id: &DeviceId) -> Result<Vec<(Asset, ProcessingStatus)>> {
        self.devices.get(id).await?;
        let assets = self.assets.list_for_device(id).await?;
        Ok(assets
            .into_iter()
            .map(|asset| {
                let status = self.status.get(id, &asset.name);
                (asset, status)
            })
            .collect())
    }

    pub async fn get_asset(&self, id: &DeviceId, name: &str) -> Result<Asset> {
        self.assets.get(id, name).await
    }

    /// Remove an asset record; bytes (and any conversion cache) are deleted
    /// only when this record was the last referrer of its path.
    pub async fn remove_asset(&self, id: &DeviceId, name: &str) -> Result<()> {
        let asset = self.assets.remove(id, name).await?;
        self.status.clear(id, name);

        if self.assets.path_referrers(&asset.path).await? == 0 {
            remove_bytes(&asset.path).await;
        } else {
            debug!(
                device_id = %id.as_str(),
                asset = %name,
                "bytes kept: shared with another device"
            );
        }
        Ok(())
    }

    /// Rename an asset record. The physical file follows only when it lives
    /// in this device's directory and no other record points at it.
    pub async fn rename_asset(&self, id: &DeviceId, from: &str, to: &str) -> Result<Asset> {
        if to != safe_filename(to) {
            return Err(Error::Validation(format!(
                "'{to}' is not a safe storage name"
            )));
        }
        let device = self.devices.get(id).await?;
        let asset = self.assets.get(id, from).await?;
        let dir = self.device_dir(&device);

        let exclusive = asset.path.starts_with(&dir)
            && self.assets.path_referrers(&asset.path).await? == 1;

        let mut renamed = self.assets.rename(id, from, to).await?;
        if exclusive {
            let new_path = dir.join(to);
            fs::rename(&asset.path, &new_path).await?;
            renamed.path = new_path;
            renamed = self.assets.upsert(renamed).await?;
        }
        self.status.rename(id, from, to);
        Ok(renamed)
    }

    /// Stage-and-swap a copy of `name` into place as the device's
    /// `default.<ext>` placeholder. At most one placeholder per device;
    /// paginated kinds are not eligible.
    pub async fn set_placeholder(&self, id: &DeviceId, name: &str) -> Result<Asset> {
        let kind = MediaKind::from_name(name);
        if kind.is_paginated() {
            return Err(Error::Validation(format!(
                "'{name}' is paginated and cannot be a placeholder"
            )));
        }

        let device = self.devices.get(id).await?;
        let asset = self.assets.get(id, name).await?;
        let dir = self.device_dir(&device);

        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .ok_or_else(|| Error::Validation(format!("'{name}' has no extension")))?;

        // Copy to a staged temp first so a crash never leaves a half-written
        // placeholder under the visible name.
        let staged = dir.join(format!(
            ".tmp_default_{}.{ext}",
            chrono::Utc::now().timestamp_millis()
        ));
        fs::copy(&asset.path, &staged).await?;

        self.clear_placeholder(id).await?;

        let final_name = format!("default.{ext}");
        let final_path = dir.join(&final_name);
        fs::rename(&staged, &final_path).await?;

        let size = fs::metadata(&final_path).await?.len();
        let mut placeholder = Asset::new(
            id.clone(),
            final_name,
            asset.original_name.clone(),
            final_path,
            size,
        );
        placeholder.is_placeholder = true;
        placeholder.media = asset.media.clone();
        let placeholder = self.assets.upsert(placeholder).await?;

        info!(device_id = %id.as_str(), source = %name, "placeholder set");
        Ok(placeholder)
    }

    /// Remove the device's placeholder, if one is set.
    pub async fn clear_placeholder(&self, id: &DeviceId) -> Result<()> {
        let Some(placeholder) = self.assets.find_placeholder(id).await? else {
            return Ok(());
        };
        self.assets.remove(id, &placeholder.name).await?;
        // The placeholder is always a private copy, never shared bytes.
        remove_bytes(&placeholder.path).await;
        Ok(())
    }
}

/// Best-effort removal of a file or directory; absence is not an error.
async fn remove_bytes(path: &std::path::Path) {
    let result = match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "failed to remove bytes");
    }
}
