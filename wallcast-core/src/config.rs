use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub presence: PresenceConfig,
    pub conversion: ConversionConfig,
    pub optimization: OptimizationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one folder per device.
    pub root: String,
    /// Maximum accepted upload size in bytes.
    pub max_file_size: u64,
    /// Files at or above this size get a prefix hash for fast dedup lookups.
    pub partial_hash_threshold: u64,
    /// How many leading bytes the prefix hash covers.
    pub partial_hash_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "./storage".to_string(),
            max_file_size: crate::validation::MAX_FILE_SIZE,
            partial_hash_threshold: 100 * 1024 * 1024,
            partial_hash_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Seconds of heartbeat silence before a session is force-evicted.
    pub heartbeat_timeout_secs: u64,
    /// Seconds between sweep passes over all sessions.
    pub sweep_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Rasterization density in DPI.
    pub density: u32,
    /// Rendered page width in pixels.
    pub page_width: u32,
    /// Rendered page height in pixels.
    pub page_height: u32,
    pub soffice_bin: String,
    pub pdftoppm_bin: String,
    pub unzip_bin: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            density: 150,
            page_width: 1920,
            page_height: 1080,
            soffice_bin: "soffice".to_string(),
            pdftoppm_bin: "pdftoppm".to_string(),
            unzip_bin: "unzip".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    /// Master switch; when off, every video is reported as within profile.
    pub enabled: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: f64,
    /// Bits per second.
    pub max_bitrate: u64,
    /// Emit a progress event every N percent.
    pub progress_step: u8,
    /// Upper bound on a single transcode run.
    pub transcode_deadline_secs: u64,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_width: 1920,
            max_height: 1080,
            max_fps: 30.0,
            max_bitrate: 6_000_000,
            progress_step: 5,
            transcode_deadline_secs: 3600,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (WALLCAST_LOGGING_LEVEL, etc.)
        builder = builder.add_source(
            Environment::with_prefix("WALLCAST")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn storage_root(&self) -> &Path {
        Path::new(&self.storage.root)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.presence.heartbeat_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence.sweep_interval_secs)
    }

    #[must_use]
    pub const fn transcode_deadline(&self) -> Duration {
        Duration::from_secs(self.optimization.transcode_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.presence.heartbeat_timeout_secs, 30);
        assert_eq!(config.presence.sweep_interval_secs, 10);
        assert!(config.optimization.enabled);
        assert!(config.storage.partial_hash_bytes < config.storage.partial_hash_threshold);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.optimization.max_width, 1920);
    }
}
