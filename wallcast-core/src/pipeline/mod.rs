//! The content pipeline: ingestion, dedup, document conversion, video
//! optimization, and the advisory status tracker.

pub mod convert;
pub mod ingest;
pub mod optimize;
pub mod probe;
pub mod status;

use std::path::Path;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, error, info};

pub use convert::{ArchiveExtractor, ConversionService, DocumentRenderer, ExternalRenderer};
pub use ingest::{IngestService, Upload};
pub use optimize::{needs_optimization, target_profile, FfmpegEngine, OptimizeService, TranscodeEngine};
pub use probe::{FfprobeProber, MediaProber};
pub use status::StatusTracker;

use crate::events::DeviceEvent;
use crate::hub::EventHub;
use crate::models::{DeviceId, MediaKind};
use crate::Result;

/// Facade tying the pipeline stages together: ingest a batch, then hand each
/// asset to the worker its kind calls for. Workers run detached so one slow
/// transcode never blocks the upload reply, and a failure in one asset never
/// touches another.
#[derive(Clone)]
pub struct MediaPipeline {
    ingest: IngestService,
    conversion: ConversionService,
    optimization: OptimizeService,
    hub: EventHub,
}

impl MediaPipeline {
    #[must_use]
    pub fn new(
        ingest: IngestService,
        conversion: ConversionService,
        optimization: OptimizeService,
        hub: EventHub,
    ) -> Self {
        Self {
            ingest,
            conversion,
            optimization,
            hub,
        }
    }

    #[must_use]
    pub fn conversion(&self) -> &ConversionService {
        &self.conversion
    }

    #[must_use]
    pub fn optimization(&self) -> &OptimizeService {
        &self.optimization
    }

    /// Ingest a batch and dispatch per-kind processing. Returns the canonical
    /// storage names as soon as registration completes; conversion and
    /// transcoding continue in the background.
    pub async fn process_upload(
        &self,
        device_id: &DeviceId,
        uploads: Vec<Upload>,
    ) -> Result<Vec<String>> {
        let names = self.ingest.ingest_batch(device_id, uploads).await?;
        for name in &names {
            self.dispatch(device_id, name);
        }
        self.hub.publish(DeviceEvent::DevicesChanged {
            timestamp: Utc::now(),
        });
        Ok(names)
    }

    fn dispatch(&self, device_id: &DeviceId, name: &str) {
        let device_id = device_id.clone();
        let name = name.to_string();

        if name.to_ascii_lowercase().ends_with(".zip") {
            let conversion = self.conversion.clone();
            tokio::spawn(async move {
                if let Err(err) = conversion.expand_archive(&device_id, &name).await {
                    error!(device_id = %device_id.as_str(), file = %name, error = %err, "archive expansion failed");
                }
            });
            return;
        }

        match MediaKind::from_name(&name) {
            MediaKind::Video => {
                let optimization = self.optimization.clone();
                tokio::spawn(async move {
                    if let Err(err) = optimization.optimize(&device_id, &name).await {
                        error!(device_id = %device_id.as_str(), file = %name, error = %err, "optimization failed");
                    }
                });
            }
            MediaKind::Pdf | MediaKind::Pptx => {
                let conversion = self.conversion.clone();
                tokio::spawn(async move {
                    if let Err(err) = conversion.convert(&device_id, &name).await {
                        error!(device_id = %device_id.as_str(), file = %name, error = %err, "conversion failed");
                    }
                });
            }
            _ => {}
        }
    }
}

/// Startup hygiene: stale transcode temps and staged placeholder temps under
/// the storage root are leftovers of an interrupted run.
pub async fn cleanup_stale_temps(storage_root: &Path) -> Result<usize> {
    let mut removed = 0;
    if !fs::try_exists(storage_root).await? {
        return Ok(0);
    }

    let mut roots = fs::read_dir(storage_root).await?;
    while let Some(device_dir) = roots.next_entry().await? {
        if !device_dir.file_type().await?.is_dir() {
            continue;
        }
        let mut entries = fs::read_dir(device_dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".optimizing_") || name.starts_with(".tmp_default_") {
                debug!(path = %entry.path().display(), "removing stale temp");
                let result = if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(entry.path()).await
                } else {
                    fs::remove_file(entry.path()).await
                };
                if result.is_ok() {
                    removed += 1;
                }
            }
        }
    }

    if removed > 0 {
        info!(removed, "cleaned up stale pipeline temps");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::write_file;

    #[tokio::test]
    async fn stale_temps_are_swept_on_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tv1");
        write_file(&dir, ".optimizing_1700000000.mp4", b"partial");
        write_file(&dir, ".tmp_default_1700000000.png", b"staged");
        write_file(&dir, "movie.mp4", b"keep");

        let removed = cleanup_stale_temps(tmp.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(dir.join("movie.mp4").exists());
        assert!(!dir.join(".optimizing_1700000000.mp4").exists());
    }

    #[tokio::test]
    async fn missing_root_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let removed = cleanup_stale_temps(&tmp.path().join("nowhere")).await.unwrap();
        assert_eq!(removed, 0);
    }
}
