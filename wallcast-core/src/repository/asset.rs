use std::path::Path;

use async_trait::async_trait;

use crate::models::{Asset, DeviceId};
use crate::Result;

/// Store abstraction for asset records.
///
/// Assets are keyed by `(device, safe name)`. Several records may point at
/// one physical path when deduplication shares bytes; `path_referrers` is the
/// reference count that gates physical deletion.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Insert or replace the record for `(asset.device_id, asset.name)`.
    async fn upsert(&self, asset: Asset) -> Result<Asset>;

    /// Fetch one record. Fails with `NotFound`.
    async fn get(&self, device_id: &DeviceId, name: &str) -> Result<Asset>;

    async fn list_for_device(&self, device_id: &DeviceId) -> Result<Vec<Asset>>;

    /// Remove one record, returning it. Fails with `NotFound`.
    async fn remove(&self, device_id: &DeviceId, name: &str) -> Result<Asset>;

    /// Remove every record of a device, returning them.
    async fn remove_device(&self, device_id: &DeviceId) -> Result<Vec<Asset>>;

    /// Rename a record within its device. Fails with `NotFound` for the
    /// source and `AlreadyExists` for the target.
    async fn rename(&self, device_id: &DeviceId, from: &str, to: &str) -> Result<Asset>;

    /// Find an asset with matching hash and exact size on another device.
    /// `hash` is compared against both the partial and the full hash, so
    /// callers pass whichever their candidate's size calls for.
    async fn find_duplicate(
        &self,
        hash: &str,
        size: u64,
        exclude_device: &DeviceId,
    ) -> Result<Option<Asset>>;

    /// How many records point at `path`.
    async fn path_referrers(&self, path: &Path) -> Result<usize>;

    /// Whether any record of another device points inside `dir`. Gates
    /// wholesale directory removal when a device is deleted.
    async fn any_path_under(&self, dir: &Path, exclude_device: &DeviceId) -> Result<bool>;

    /// The device's placeholder asset, if one is set.
    async fn find_placeholder(&self, device_id: &DeviceId) -> Result<Option<Asset>>;
}
