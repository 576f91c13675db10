use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::models::{Asset, Device, DeviceId};
use crate::{Error, Result};

use super::{AssetStore, DeviceStore};

/// DashMap-backed device store for single-node deployments and tests.
#[derive(Clone, Default)]
pub struct MemoryDeviceStore {
    devices: Arc<DashMap<DeviceId, Device>>,
}

impl MemoryDeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn insert(&self, device: Device) -> Result<Device> {
        match self.devices.entry(device.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AlreadyExists(format!(
                "device '{}'",
                device.id.as_str()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(device.clone());
                Ok(device)
            }
        }
    }

    async fn get(&self, id: &DeviceId) -> Result<Device> {
        self.devices
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::NotFound(format!("device '{}'", id.as_str())))
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.iter().map(|e| e.value().clone()).collect();
        devices.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(devices)
    }

    async fn update(&self, device: Device) -> Result<Device> {
        match self.devices.entry(device.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                slot.insert(device.clone());
                Ok(device)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(Error::NotFound(format!(
                "device '{}'",
                device.id.as_str()
            ))),
        }
    }

    async fn remove(&self, id: &DeviceId) -> Result<()> {
        self.devices
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("device '{}'", id.as_str())))
    }
}

/// DashMap-backed asset store keyed by `(device, name)`.
#[derive(Clone, Default)]
pub struct MemoryAssetStore {
    assets: Arc<DashMap<(DeviceId, String), Asset>>,
}

impl MemoryAssetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn upsert(&self, asset: Asset) -> Result<Asset> {
        self.assets
            .insert((asset.device_id.clone(), asset.name.clone()), asset.clone());
        Ok(asset)
    }

    async fn get(&self, device_id: &DeviceId, name: &str) -> Result<Asset> {
        self.assets
            .get(&(device_id.clone(), name.to_string()))
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                Error::NotFound(format!("asset '{}' on device '{}'", name, device_id.as_str()))
            })
    }

    async fn list_for_device(&self, device_id: &DeviceId) -> Result<Vec<Asset>> {
        let mut assets: Vec<Asset> = self
            .assets
            .iter()
            .filter(|entry| &entry.key().0 == device_id)
            .map(|entry| entry.value().clone())
            .collect();
        assets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(assets)
    }

    async fn remove(&self, device_id: &DeviceId, name: &str) -> Result<Asset> {
        self.assets
            .remove(&(device_id.clone(), name.to_string()))
            .map(|(_, asset)| asset)
            .ok_or_else(|| {
                Error::NotFound(format!("asset '{}' on device '{}'", name, device_id.as_str()))
            })
    }

    async fn remove_device(&self, device_id: &DeviceId) -> Result<Vec<Asset>> {
        let keys: Vec<(DeviceId, String)> = self
            .assets
            .iter()
            .filter(|entry| &entry.key().0 == device_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, asset)) = self.assets.remove(&key) {
                removed.push(asset);
            }
        }
        Ok(removed)
    }

    async fn rename(&self, device_id: &DeviceId, from: &str, to: &str) -> Result<Asset> {
        if self
            .assets
            .contains_key(&(device_id.clone(), to.to_string()))
        {
            return Err(Error::AlreadyExists(format!(
                "asset '{}' on device '{}'",
                to,
                device_id.as_str()
            )));
        }
        let (_, mut asset) = self
            .assets
            .remove(&(device_id.clone(), from.to_string()))
            .ok_or_else(|| {
                Error::NotFound(format!("asset '{}' on device '{}'", from, device_id.as_str()))
            })?;
        asset.name = to.to_string();
        self.assets
            .insert((device_id.clone(), to.to_string()), asset.clone());
        Ok(asset)
    }

    async fn find_duplicate(
        &self,
        hash: &str,
        size: u64,
        exclude_device: &DeviceId,
    ) -> Result<Option<Asset>> {
        let hit = self.assets.iter().find(|entry| {
            let asset = entry.value();
            asset.device_id != *exclude_device
                && asset.size == size
                && (asset.partial_hash.as_deref() == Some(hash)
                    || asset.content_hash.as_deref() == Some(hash))
        });
        Ok(hit.map(|entry| entry.value().clone()))
    }

    async fn path_referrers(&self, path: &Path) -> Result<usize> {
        Ok(self
            .assets
            .iter()
            .filter(|entry| entry.value().path == path)
            .count())
    }

    async fn any_path_under(&self, dir: &Path, exclude_device: &DeviceId) -> Result<bool> {
        Ok(self.assets.iter().any(|entry| {
            entry.value().device_id != *exclude_device && entry.value().path.starts_with(dir)
        }))
    }

    async fn find_placeholder(&self, device_id: &DeviceId) -> Result<Option<Asset>> {
        Ok(self
            .assets
            .iter()
            .find(|entry| &entry.key().0 == device_id && entry.value().is_placeholder)
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn device(id: &str) -> Device {
        Device::new(DeviceId::from_string(id.to_string()), id.to_uppercase())
    }

    fn asset(device_id: &str, name: &str, hash: &str, size: u64) -> Asset {
        let mut asset = Asset::new(
            DeviceId::from_string(device_id.to_string()),
            name,
            name,
            PathBuf::from(format!("/srv/{device_id}/{name}")),
            size,
        );
        asset.content_hash = Some(hash.to_string());
        asset.partial_hash = Some(hash.to_string());
        asset
    }

    #[tokio::test]
    async fn device_insert_is_unique() {
        let store = MemoryDeviceStore::new();
        store.insert(device("tv1")).await.unwrap();
        assert!(store.insert(device("tv1")).await.is_err());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_lookup_excludes_uploader() {
        let store = MemoryAssetStore::new();
        store.upsert(asset("tv1", "a.mp4", "abc", 100)).await.unwrap();

        let same_device = store
            .find_duplicate("abc", 100, &DeviceId::from_string("tv1".into()))
            .await
            .unwrap();
        assert!(same_device.is_none());

        let other_device = store
            .find_duplicate("abc", 100, &DeviceId::from_string("tv2".into()))
            .await
            .unwrap();
        assert_eq!(other_device.unwrap().name, "a.mp4");

        let wrong_size = store
            .find_duplicate("abc", 99, &DeviceId::from_string("tv2".into()))
            .await
            .unwrap();
        assert!(wrong_size.is_none());
    }

    #[tokio::test]
    async fn path_referrers_counts_shared_paths() {
        let store = MemoryAssetStore::new();
        let original = asset("tv1", "a.mp4", "abc", 100);
        let mut shared = asset("tv2", "a.mp4", "abc", 100);
        shared.path = original.path.clone();

        store.upsert(original.clone()).await.unwrap();
        store.upsert(shared).await.unwrap();

        assert_eq!(store.path_referrers(&original.path).await.unwrap(), 2);
        store
            .remove(&DeviceId::from_string("tv2".into()), "a.mp4")
            .await
            .unwrap();
        assert_eq!(store.path_referrers(&original.path).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rename_rejects_collisions() {
        let store = MemoryAssetStore::new();
        let tv1 = DeviceId::from_string("tv1".to_string());
        store.upsert(asset("tv1", "a.mp4", "h1", 1)).await.unwrap();
        store.upsert(asset("tv1", "b.mp4", "h2", 2)).await.unwrap();

        assert!(store.rename(&tv1, "a.mp4", "b.mp4").await.is_err());
        let renamed = store.rename(&tv1, "a.mp4", "c.mp4").await.unwrap();
        assert_eq!(renamed.name, "c.mp4");
        assert!(store.get(&tv1, "a.mp4").await.is_err());
    }
}
