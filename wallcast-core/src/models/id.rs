use nanoid::nanoid;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::validation::validate_device_id;

/// Device ID type — administrator-chosen, restricted charset.
///
/// The id doubles as the device's directory name under the storage root, so
/// construction from external input must go through [`DeviceId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Validate and wrap an externally supplied id.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_device_id(&id)?;
        Ok(Self(id))
    }

    /// Wrap an id that already passed validation (e.g. read back from the
    /// store).
    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session ID type (12-character nanoid)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid!(12))
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
