use async_trait::async_trait;

use crate::models::{Device, DeviceId};
use crate::Result;

/// Store abstraction for device records.
///
/// The concrete backend is deliberately out of scope; the in-memory
/// implementation in [`super::memory`] backs single-node deployments and
/// tests.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert a new device. Fails with `AlreadyExists` on id collision.
    async fn insert(&self, device: Device) -> Result<Device>;

    /// Fetch a device by id. Fails with `NotFound`.
    async fn get(&self, id: &DeviceId) -> Result<Device>;

    async fn list(&self) -> Result<Vec<Device>>;

    /// Replace an existing device record. Fails with `NotFound`.
    async fn update(&self, device: Device) -> Result<Device>;

    /// Remove a device record. Fails with `NotFound`.
    async fn remove(&self, id: &DeviceId) -> Result<()>;
}
