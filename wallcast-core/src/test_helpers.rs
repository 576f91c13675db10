//! Shared fixtures and stub engines for wallcast-core tests.
//!
//! The external toolchain (ffprobe/ffmpeg/soffice/pdftoppm/unzip) is replaced
//! by stubs behind the same traits, so the full pipeline runs in tests
//! without any of the tools installed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::OptimizationConfig;
use crate::hub::EventHub;
use crate::models::{Asset, DeviceId, MediaInfo};
use crate::pipeline::convert::{ArchiveExtractor, ConversionService, DocumentRenderer};
use crate::pipeline::optimize::{OptimizeService, TargetProfile, TranscodeEngine};
use crate::pipeline::probe::MediaProber;
use crate::pipeline::status::StatusTracker;
use crate::repository::{MemoryAssetStore, MemoryDeviceStore};
use crate::service::control::ControlService;
use crate::service::registry::DeviceRegistry;
use crate::{Error, Result};

/// Write a file, creating parent directories as needed.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    std::fs::create_dir_all(dir).expect("create test dir");
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write test file");
    path
}

/// One registry + hub + device `tv1` over a scratch storage root.
pub struct TestHarness {
    pub registry: DeviceRegistry,
    pub hub: EventHub,
    pub status: StatusTracker,
    pub device_id: DeviceId,
    tmp: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let status = StatusTracker::new();
        let registry = DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(MemoryAssetStore::new()),
            status.clone(),
            tmp.path().to_path_buf(),
        );
        let device = registry
            .create_device("tv1", "Test device")
            .await
            .expect("create device");
        Self {
            registry,
            hub: EventHub::new(),
            status,
            device_id: device.id,
            tmp,
        }
    }

    pub fn storage_root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn device_dir(&self) -> PathBuf {
        self.tmp.path().join("tv1")
    }

    pub async fn upsert_asset(&self, name: &str, path: PathBuf, size: u64) -> Asset {
        let asset = Asset::new(self.device_id.clone(), name, name, path, size);
        self.registry
            .asset_store()
            .upsert(asset)
            .await
            .expect("upsert asset")
    }

    pub fn conversion_with<R>(&self, renderer: Arc<R>) -> ConversionService
    where
        R: DocumentRenderer + ArchiveExtractor + 'static,
    {
        ConversionService::new(
            self.registry.clone(),
            renderer.clone(),
            renderer,
            self.hub.clone(),
        )
    }

    pub fn control(&self) -> ControlService {
        ControlService::new(
            self.registry.clone(),
            self.conversion_with(Arc::new(StubRenderer::with_pages(0))),
            self.hub.clone(),
        )
    }

    pub fn optimize_with(
        &self,
        prober: Arc<dyn MediaProber>,
        engine: Arc<dyn TranscodeEngine>,
    ) -> OptimizeService {
        OptimizeService::new(
            self.registry.clone(),
            prober,
            engine,
            self.hub.clone(),
            OptimizationConfig::default(),
            CancellationToken::new(),
        )
    }
}

/// Prober returning a fixed [`MediaInfo`] (or failing), counting calls.
pub struct StubProber {
    info: MediaInfo,
    fail: bool,
    calls: AtomicUsize,
}

impl StubProber {
    pub fn of(info: MediaInfo) -> Self {
        Self {
            info,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn video(width: u32, height: u32) -> Self {
        Self::of(MediaInfo {
            width: Some(width),
            height: Some(height),
            duration_secs: Some(10.0),
            fps: Some(25.0),
            video_codec: Some("h264".into()),
            video_profile: Some("High".into()),
            video_bitrate: Some(2_000_000),
            ..MediaInfo::default()
        })
    }

    pub fn failing() -> Self {
        Self {
            info: MediaInfo::default(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProber for StubProber {
    async fn probe(&self, _path: &Path) -> Result<MediaInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(Error::external_tool("ffprobe", "stub probe failure"))
        } else {
            Ok(self.info.clone())
        }
    }
}

/// Renderer/extractor stub producing deterministic artifacts on disk.
pub struct StubRenderer {
    pages: u32,
    to_pdf_calls: AtomicUsize,
    rasterize_calls: AtomicUsize,
}

impl StubRenderer {
    pub fn with_pages(pages: u32) -> Self {
        Self {
            pages,
            to_pdf_calls: AtomicUsize::new(0),
            rasterize_calls: AtomicUsize::new(0),
        }
    }

    pub fn to_pdf_calls(&self) -> usize {
        self.to_pdf_calls.load(Ordering::SeqCst)
    }

    pub fn rasterize_calls(&self) -> usize {
        self.rasterize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentRenderer for StubRenderer {
    async fn to_pdf(&self, input: &Path, out_dir: &Path) -> Result<PathBuf> {
        self.to_pdf_calls.fetch_add(1, Ordering::SeqCst);
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(write_file(out_dir, &format!("{stem}.pdf"), b"%PDF-stub"))
    }

    async fn rasterize(&self, _pdf: &Path, out_dir: &Path) -> Result<u32> {
        self.rasterize_calls.fetch_add(1, Ordering::SeqCst);
        for page in 1..=self.pages {
            write_file(out_dir, &format!("page_{page:04}.png"), b"png-stub");
        }
        Ok(self.pages)
    }
}

#[async_trait]
impl ArchiveExtractor for StubRenderer {
    async fn extract(&self, _archive: &Path, out_dir: &Path) -> Result<()> {
        // Mixed content: image entries in scrambled natural order plus one
        // non-image that expansion must drop.
        write_file(out_dir, "shot-10.png", b"png");
        write_file(out_dir, "shot-2.jpg", b"jpg");
        write_file(out_dir, "shot-1.jpg", b"jpg");
        write_file(out_dir, "notes.txt", b"txt");
        Ok(())
    }
}

/// Renderer/extractor whose every operation fails with a tool error.
pub struct FailingRenderer;

#[async_trait]
impl DocumentRenderer for FailingRenderer {
    async fn to_pdf(&self, _input: &Path, _out_dir: &Path) -> Result<PathBuf> {
        Err(Error::external_tool("soffice", "stub conversion failure"))
    }

    async fn rasterize(&self, _pdf: &Path, _out_dir: &Path) -> Result<u32> {
        Err(Error::external_tool("pdftoppm", "stub rasterize failure"))
    }
}

#[async_trait]
impl ArchiveExtractor for FailingRenderer {
    async fn extract(&self, _archive: &Path, _out_dir: &Path) -> Result<()> {
        Err(Error::external_tool("unzip", "stub extract failure"))
    }
}

/// Transcode engine writing a stub MP4 and reporting a few positions.
pub struct StubEngine {
    calls: AtomicUsize,
}

impl StubEngine {
    pub fn succeeding() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscodeEngine for StubEngine {
    async fn transcode(
        &self,
        _input: &Path,
        output: &Path,
        _profile: &TargetProfile,
        _max_fps: f64,
        progress: mpsc::UnboundedSender<f64>,
        _cancel: CancellationToken,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for position in [15.0, 30.0, 45.0, 60.0] {
            let _ = progress.send(position);
        }
        tokio::fs::write(output, b"mp4-stub").await?;
        Ok(())
    }
}

/// Engine that fails the way ffmpeg does on an unreadable source.
pub struct FailingEngine;

#[async_trait]
impl TranscodeEngine for FailingEngine {
    async fn transcode(
        &self,
        _input: &Path,
        _output: &Path,
        _profile: &TargetProfile,
        _max_fps: f64,
        _progress: mpsc::UnboundedSender<f64>,
        _cancel: CancellationToken,
    ) -> Result<()> {
        Err(Error::external_tool(
            "ffmpeg",
            "Decoder (codec hevc) not found for input stream",
        ))
    }
}
