pub mod asset;
pub mod device;
pub mod memory;

pub use asset::AssetStore;
pub use device::DeviceStore;
pub use memory::{MemoryAssetStore, MemoryDeviceStore};
