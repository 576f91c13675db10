//! Upload intake: safe naming, content hashing, cross-device dedup, and
//! always-registered asset records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::models::{Asset, Device, DeviceId, MediaKind, ProcessingStatus};
use crate::pipeline::probe::MediaProber;
use crate::service::registry::DeviceRegistry;
use crate::validation::{ensure_within_root, is_system_entry, safe_filename};
use crate::{Error, Result};

/// One named byte stream from an upload batch.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub data: Vec<u8>,
}

impl Upload {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Turns uploaded bytes into registered, deduplicated asset records.
#[derive(Clone)]
pub struct IngestService {
    registry: DeviceRegistry,
    prober: Arc<dyn MediaProber>,
    config: StorageConfig,
}

impl IngestService {
    #[must_use]
    pub fn new(registry: DeviceRegistry, prober: Arc<dyn MediaProber>, config: StorageConfig) -> Self {
        Self {
            registry,
            prober,
            config,
        }
    }

    /// Ingest a batch, one failure never aborting the rest. Returns the
    /// canonical storage names of the files that registered; failures are
    /// logged and surfaced through the status tracker under the upload name.
    pub async fn ingest_batch(
        &self,
        device_id: &DeviceId,
        uploads: Vec<Upload>,
    ) -> Result<Vec<String>> {
        let device = self.registry.get_device(device_id).await?;

        let results = join_all(
            uploads
                .into_iter()
                .map(|upload| self.ingest_labelled(&device, upload)),
        )
        .await;

        let mut names = Vec::with_capacity(results.len());
        for (original, result) in results {
            match result {
                Ok(asset) => names.push(asset.name),
                Err(err) => {
                    warn!(
                        device_id = %device_id.as_str(),
                        file = %original,
                        error = %err,
                        "upload failed"
                    );
                    self.registry.status_tracker().set(
                        device_id,
                        &original,
                        ProcessingStatus::error(err.to_string(), false),
                    );
                }
            }
        }
        Ok(names)
    }

    async fn ingest_labelled(&self, device: &Device, upload: Upload) -> (String, Result<Asset>) {
        let original = upload.name.clone();
        let result = self.ingest_one(device, upload).await;
        (original, result)
    }

    /// Ingest a single upload. An asset record is always created once the
    /// bytes are written; enrichment failures (probe) degrade, not abort.
    pub async fn ingest_one(&self, device: &Device, upload: Upload) -> Result<Asset> {
        let size = upload.data.len() as u64;
        if size == 0 {
            return Err(Error::Validation(format!("'{}' is empty", upload.name)));
        }
        if size > self.config.max_file_size {
            return Err(Error::Validation(format!(
                "'{}' exceeds the {} byte upload limit",
                upload.name, self.config.max_file_size
            )));
        }

        let name = self.assign_name(device, &upload.name).await?;
        let dir = self.registry.device_dir(device);
        let path = ensure_within_root(self.registry.storage_root(), &dir.join(&name))?;

        let status = self.registry.status_tracker();
        status.set(&device.id, &name, ProcessingStatus::checking());

        fs::write(&path, &upload.data).await?;

        let (full_hash, partial_hash) = self.hash(upload.data, size).await?;
        let mut asset = Asset::new(device.id.clone(), &name, &upload.name, path.clone(), size);
        asset.content_hash = Some(full_hash);
        asset.partial_hash = Some(partial_hash.clone());
        asset.modified_at = file_mtime(&path).await;

        let lookup = if size >= self.config.partial_hash_threshold {
            &partial_hash
        } else {
            asset.content_hash.as_deref().unwrap_or(&partial_hash)
        };
        match self
            .registry
            .asset_store()
            .find_duplicate(lookup, size, &device.id)
            .await?
        {
            Some(existing) => {
                // Same bytes already live elsewhere: keep one physical copy
                // and point the new record at it.
                if !existing.path.starts_with(self.registry.storage_root()) {
                    return Err(Error::integrity(format!(
                        "dedup match '{}' lies outside the storage root",
                        existing.path.display()
                    )));
                }
                fs::remove_file(&path).await?;
                info!(
                    device_id = %device.id.as_str(),
                    file = %name,
                    matched_device = %existing.device_id.as_str(),
                    "dedup hit, sharing existing bytes"
                );
                asset.path = existing.path.clone();
                asset.media = existing.media.clone();
            }
            None => {
                if MediaKind::from_name(&name).is_video() {
                    match self.prober.probe(&path).await {
                        Ok(info) => asset.media = Some(info),
                        Err(err) => {
                            warn!(
                                device_id = %device.id.as_str(),
                                file = %name,
                                error = %err,
                                "probe failed, registering without media attributes"
                            );
                        }
                    }
                }
            }
        }

        let asset = self.registry.asset_store().upsert(asset).await?;
        status.clear(&device.id, &name);
        debug!(device_id = %device.id.as_str(), file = %name, size, "asset registered");
        Ok(asset)
    }

    /// Safe storage name for an upload, with a short random suffix on
    /// collision within the device.
    async fn assign_name(&self, device: &Device, original: &str) -> Result<String> {
        let safe = safe_filename(original);
        if is_system_entry(&safe) {
            return Err(Error::Validation(format!(
                "'{original}' maps to a reserved storage name"
            )));
        }
        if self
            .registry
            .asset_store()
            .get(&device.id, &safe)
            .await
            .is_err()
        {
            return Ok(safe);
        }

        let suffixed = match safe.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}_{}.{ext}", nanoid::nanoid!(6)),
            None => format!("{safe}_{}", nanoid::nanoid!(6)),
        };
        Ok(suffixed)
    }

    /// SHA-256 of the whole stream, plus the prefix hash used as the fast
    /// dedup key for large files. For small files the two coincide.
    async fn hash(&self, data: Vec<u8>, size: u64) -> Result<(String, String)> {
        let threshold = self.config.partial_hash_threshold;
        let prefix_len = usize::try_from(self.config.partial_hash_bytes).unwrap_or(usize::MAX);
        tokio::task::spawn_blocking(move || {
            let full = hex::encode(Sha256::digest(&data));
            let partial = if size >= threshold {
                let end = prefix_len.min(data.len());
                hex::encode(Sha256::digest(&data[..end]))
            } else {
                full.clone()
            };
            (full, partial)
        })
        .await
        .map_err(|e| Error::Internal(format!("hashing task failed: {e}")))
    }
}

async fn file_mtime(path: &std::path::Path) -> DateTime<Utc> {
    match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(mtime) => mtime.into(),
        Err(_) => Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{StubProber, TestHarness};

    fn service(harness: &TestHarness, prober: Arc<StubProber>) -> IngestService {
        IngestService::new(harness.registry.clone(), prober, StorageConfig::default())
    }

    #[tokio::test]
    async fn upload_registers_and_writes_bytes() {
        let harness = TestHarness::new().await;
        let prober = Arc::new(StubProber::video(1280, 720));
        let ingest = service(&harness, prober.clone());

        let names = ingest
            .ingest_batch(
                &harness.device_id,
                vec![Upload::new("My Clip (1).mp4", b"videobytes".to_vec())],
            )
            .await
            .unwrap();
        assert_eq!(names, vec!["My_Clip_1.mp4".to_string()]);

        let asset = harness
            .registry
            .get_asset(&harness.device_id, "My_Clip_1.mp4")
            .await
            .unwrap();
        assert_eq!(asset.original_name, "My Clip (1).mp4");
        assert_eq!(asset.size, 10);
        assert!(asset.content_hash.is_some());
        assert_eq!(asset.media.as_ref().unwrap().width, Some(1280));
        assert!(asset.path.exists());
        assert_eq!(prober.calls(), 1);
    }

    #[tokio::test]
    async fn dedup_shares_bytes_and_copies_attributes() {
        let harness = TestHarness::new().await;
        harness.registry.create_device("tv2", "Hall").await.unwrap();
        let tv2 = crate::models::DeviceId::from_string("tv2".into());
        let prober = Arc::new(StubProber::video(1920, 1080));
        let ingest = service(&harness, prober.clone());

        let bytes = b"identical content".to_vec();
        ingest
            .ingest_batch(&harness.device_id, vec![Upload::new("a.mp4", bytes.clone())])
            .await
            .unwrap();
        ingest
            .ingest_batch(&tv2, vec![Upload::new("b.mp4", bytes)])
            .await
            .unwrap();

        let first = harness.registry.get_asset(&harness.device_id, "a.mp4").await.unwrap();
        let second = harness.registry.get_asset(&tv2, "b.mp4").await.unwrap();

        assert_eq!(second.path, first.path, "zero-copy reference to the match");
        assert_eq!(second.media, first.media, "attributes copied, not recomputed");
        assert_eq!(prober.calls(), 1, "no second inspection pass");
        assert!(!harness.storage_root().join("tv2").join("b.mp4").exists());
    }

    #[tokio::test]
    async fn collisions_get_a_suffix() {
        let harness = TestHarness::new().await;
        let ingest = service(&harness, Arc::new(StubProber::video(640, 480)));

        // Different bytes, same name: both must register.
        let first = ingest
            .ingest_batch(&harness.device_id, vec![Upload::new("pic.png", b"one".to_vec())])
            .await
            .unwrap();
        let second = ingest
            .ingest_batch(&harness.device_id, vec![Upload::new("pic.png", b"two".to_vec())])
            .await
            .unwrap();

        assert_eq!(first, vec!["pic.png".to_string()]);
        assert_ne!(second[0], "pic.png");
        assert!(second[0].starts_with("pic_"));
        assert!(second[0].ends_with(".png"));
    }

    #[tokio::test]
    async fn one_bad_file_never_aborts_the_batch() {
        let harness = TestHarness::new().await;
        let ingest = service(&harness, Arc::new(StubProber::video(640, 480)));

        let names = ingest
            .ingest_batch(
                &harness.device_id,
                vec![
                    Upload::new("default.png", b"reserved".to_vec()),
                    Upload::new("ok.png", b"fine".to_vec()),
                    Upload::new("empty.png", Vec::new()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(names, vec!["ok.png".to_string()]);

        let status = harness.status.get(&harness.device_id, "default.png");
        assert_eq!(status.phase, crate::models::ProcessingPhase::Error);
    }

    #[tokio::test]
    async fn probe_failure_never_blocks_registration() {
        let harness = TestHarness::new().await;
        let ingest = service(&harness, Arc::new(StubProber::failing()));

        let names = ingest
            .ingest_batch(
                &harness.device_id,
                vec![Upload::new("broken.mp4", b"not really video".to_vec())],
            )
            .await
            .unwrap();
        assert_eq!(names.len(), 1);

        let asset = harness.registry.get_asset(&harness.device_id, &names[0]).await.unwrap();
        assert!(asset.media.is_none());
        assert!(asset.content_hash.is_some());
    }
}
