pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod repository;
pub mod service;
pub mod validation;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{DeviceEvent, RejectReason};
pub use hub::EventHub;
