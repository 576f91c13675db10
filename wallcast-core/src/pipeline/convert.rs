//! Paginated document conversion: one document asset becomes a directory with
//! an ordered set of rendered page images.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ConversionConfig;
use crate::events::DeviceEvent;
use crate::hub::EventHub;
use crate::models::{Asset, DeviceId, MediaKind, ProcessingStatus, IMAGE_EXTENSIONS};
use crate::service::registry::DeviceRegistry;
use crate::{Error, Result};

/// Staging directory inside a document's cache dir; renamed to `pages` once
/// rendering completes, so a crash never leaves a half-rendered page set
/// masquerading as finished.
const PAGES_STAGING: &str = ".pages_tmp";
/// Final page directory; its image count is the authoritative page count.
const PAGES_DIR: &str = "pages";

/// Seam over the external document toolchain.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Render a slide deck to a PDF inside `out_dir`, returning the PDF path.
    async fn to_pdf(&self, input: &Path, out_dir: &Path) -> Result<PathBuf>;

    /// Rasterize every page of `pdf` into `out_dir` as `page_NNNN.png`,
    /// returning the page count.
    async fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<u32>;
}

/// Seam over the external archive tool.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Unpack `archive` into `out_dir`, flattening any subdirectories.
    async fn extract(&self, archive: &Path, out_dir: &Path) -> Result<()>;
}

/// Production renderer shelling out to `soffice`, `pdftoppm`, and `unzip`.
pub struct ExternalRenderer {
    config: ConversionConfig,
}

impl ExternalRenderer {
    #[must_use]
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }
}

async fn run_tool(tool: &str, command: &mut Command) -> Result<()> {
    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::external_tool(tool, format!("failed to spawn: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::external_tool(
            tool,
            format!("{}: {}", output.status, stderr.trim()),
        ))
    }
}

#[async_trait]
impl DocumentRenderer for ExternalRenderer {
    async fn to_pdf(&self, input: &Path, out_dir: &Path) -> Result<PathBuf> {
        run_tool(
            &self.config.soffice_bin,
            Command::new(&self.config.soffice_bin)
                .args(["--headless", "--convert-to", "pdf", "--outdir"])
                .arg(out_dir)
                .arg(input),
        )
        .await?;

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pdf = out_dir.join(format!("{stem}.pdf"));
        if fs::try_exists(&pdf).await? {
            Ok(pdf)
        } else {
            Err(Error::external_tool(
                &self.config.soffice_bin,
                "conversion produced no PDF",
            ))
        }
    }

    async fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<u32> {
        run_tool(
            &self.config.pdftoppm_bin,
            Command::new(&self.config.pdftoppm_bin)
                .args(["-png", "-r", &self.config.density.to_string()])
                .arg(pdf)
                .arg(out_dir.join("page")),
        )
        .await?;

        // pdftoppm numbers its output `page-1.png`, `page-2.png`, ...;
        // renumber to the zero-padded canonical layout.
        let mut rendered = Vec::new();
        let mut entries = fs::read_dir(out_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("page") && name.ends_with(".png") {
                rendered.push(name);
            }
        }
        rendered.sort_by(|a, b| natural_cmp(a, b));

        let mut count = 0u32;
        for name in rendered {
            count += 1;
            let target = out_dir.join(page_image_name(count));
            if name != page_image_name(count) {
                fs::rename(out_dir.join(&name), target).await?;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl ArchiveExtractor for ExternalRenderer {
    async fn extract(&self, archive: &Path, out_dir: &Path) -> Result<()> {
        run_tool(
            &self.config.unzip_bin,
            Command::new(&self.config.unzip_bin)
                .args(["-o", "-j"])
                .arg(archive)
                .arg("-d")
                .arg(out_dir),
        )
        .await
    }
}

#[must_use]
fn page_image_name(page: u32) -> String {
    format!("page_{page:04}.png")
}

/// Renders paginated documents into per-asset cache directories and expands
/// image archives. Idempotent: already-rendered documents return their count
/// without touching the toolchain.
#[derive(Clone)]
pub struct ConversionService {
    registry: DeviceRegistry,
    renderer: Arc<dyn DocumentRenderer>,
    extractor: Arc<dyn ArchiveExtractor>,
    hub: EventHub,
}

impl ConversionService {
    #[must_use]
    pub fn new(
        registry: DeviceRegistry,
        renderer: Arc<dyn DocumentRenderer>,
        extractor: Arc<dyn ArchiveExtractor>,
        hub: EventHub,
    ) -> Self {
        Self {
            registry,
            renderer,
            extractor,
            hub,
        }
    }

    /// The deterministic cache directory for a document asset, named from the
    /// document's base name.
    async fn cache_dir(&self, device_id: &DeviceId, name: &str) -> Result<PathBuf> {
        let device = self.registry.get_device(device_id).await?;
        let stem = name.rsplit_once('.').map_or(name, |(s, _)| s);
        Ok(self.registry.device_dir(&device).join(stem))
    }

    /// Authoritative page count: rendered images on disk for documents, image
    /// files for image folders. 0 when unconverted or unknown.
    pub async fn page_count(&self, device_id: &DeviceId, name: &str) -> Result<u32> {
        match MediaKind::from_name(name) {
            MediaKind::Pdf | MediaKind::Pptx => {
                let pages = self.cache_dir(device_id, name).await?.join(PAGES_DIR);
                count_files(&pages, |n| n.ends_with(".png")).await
            }
            MediaKind::ImageFolder => {
                let Ok(asset) = self.registry.get_asset(device_id, name).await else {
                    return Ok(0);
                };
                count_files(&asset.path, is_image_name).await
            }
            _ => Ok(0),
        }
    }

    /// Path of one page image, index clamped to `[1, count]`.
    pub async fn page_image(&self, device_id: &DeviceId, name: &str, page: u32) -> Result<PathBuf> {
        match MediaKind::from_name(name) {
            MediaKind::Pdf | MediaKind::Pptx => {
                let count = self.page_count(device_id, name).await?;
                if count == 0 {
                    return Err(Error::NotFound(format!("'{name}' has no rendered pages")));
                }
                Ok(self
                    .cache_dir(device_id, name)
                    .await?
                    .join(PAGES_DIR)
                    .join(page_image_name(page.clamp(1, count))))
            }
            MediaKind::ImageFolder => {
                let asset = self.registry.get_asset(device_id, name).await?;
                // Bound and lookup come from the same directory read.
                let mut images = list_files(&asset.path, is_image_name).await?;
                if images.is_empty() {
                    return Err(Error::NotFound(format!("'{name}' has no rendered pages")));
                }
                images.sort_by(|a, b| natural_cmp(a, b));
                let index = (page as usize).clamp(1, images.len());
                Ok(asset.path.join(&images[index - 1]))
            }
            _ => Err(Error::Validation(format!("'{name}' is not paginated"))),
        }
    }

    /// Convert a document asset into rendered pages. Returns the page count.
    ///
    /// The document is moved into its cache directory first (the asset
    /// becomes directory-backed), pages render into a staging directory, and
    /// an atomic rename publishes them. Any failure moves the document back
    /// so the asset is never left straddling two locations; staging artifacts
    /// stay behind for diagnostics and the next attempt clears them.
    pub async fn convert(&self, device_id: &DeviceId, name: &str) -> Result<u32> {
        let kind = MediaKind::from_name(name);
        if !matches!(kind, MediaKind::Pdf | MediaKind::Pptx) {
            return Err(Error::Validation(format!("'{name}' is not a document")));
        }
        let asset = self.registry.get_asset(device_id, name).await?;
        let cache_dir = self.cache_dir(device_id, name).await?;
        let pages_dir = cache_dir.join(PAGES_DIR);

        let existing = count_files(&pages_dir, |n| n.ends_with(".png")).await?;
        if existing > 0 {
            debug!(device_id = %device_id.as_str(), file = %name, pages = existing, "already converted");
            return Ok(existing);
        }

        let status = self.registry.status_tracker();
        status.set(device_id, name, ProcessingStatus::checking());
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::ProcessingStarted {
                device_id: device_id.clone(),
                file: name.to_string(),
                timestamp: Utc::now(),
            },
        );

        // Move the document inside its cache directory; from here on the
        // visible "file" is directory-backed.
        fs::create_dir_all(&cache_dir).await?;
        let doc_path = cache_dir.join(name);
        let moved = !fs::try_exists(&doc_path).await?;
        if moved {
            fs::rename(&asset.path, &doc_path).await?;
        }

        status.set(device_id, name, ProcessingStatus::processing(20, false));
        match self.render(kind, &doc_path, &cache_dir, &pages_dir).await {
            Ok(pages) => {
                let mut record = asset;
                record.path = cache_dir;
                self.registry.asset_store().upsert(record).await?;

                status.set(device_id, name, ProcessingStatus::ready());
                info!(device_id = %device_id.as_str(), file = %name, pages, "document converted");
                self.hub.broadcast_device(
                    device_id,
                    DeviceEvent::FileReady {
                        device_id: device_id.clone(),
                        file: name.to_string(),
                        pages: Some(pages),
                        timestamp: Utc::now(),
                    },
                );
                self.hub.publish(DeviceEvent::DevicesChanged {
                    timestamp: Utc::now(),
                });
                Ok(pages)
            }
            Err(err) => {
                // Best-effort rollback: restore the original location so the
                // asset stays accessible and a later attempt starts clean.
                if moved {
                    if let Err(rollback) = fs::rename(&doc_path, &asset.path).await {
                        warn!(
                            device_id = %device_id.as_str(),
                            file = %name,
                            error = %rollback,
                            "rollback failed, document remains in cache directory"
                        );
                    }
                }
                status.set(device_id, name, ProcessingStatus::error(err.to_string(), true));
                self.hub.broadcast_device(
                    device_id,
                    DeviceEvent::FileError {
                        device_id: device_id.clone(),
                        file: name.to_string(),
                        reason: err.to_string(),
                        timestamp: Utc::now(),
                    },
                );
                Err(err)
            }
        }
    }

    async fn render(
        &self,
        kind: MediaKind,
        doc_path: &Path,
        cache_dir: &Path,
        pages_dir: &Path,
    ) -> Result<u32> {
        let staging = cache_dir.join(PAGES_STAGING);
        if fs::try_exists(&staging).await? {
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;

        let pdf = if kind == MediaKind::Pptx {
            self.renderer.to_pdf(doc_path, &staging).await?
        } else {
            doc_path.to_path_buf()
        };

        let pages = self.renderer.rasterize(&pdf, &staging).await?;
        if pages == 0 {
            return Err(Error::external_tool("pdftoppm", "no pages rendered"));
        }
        if kind == MediaKind::Pptx {
            // The intermediate PDF is not part of the page set.
            let _ = fs::remove_file(&pdf).await;
        }

        fs::rename(&staging, pages_dir).await?;
        Ok(pages)
    }

    /// Expand an uploaded archive into an image-folder asset: image entries
    /// only, flattened, renumbered `image_NNNN.<ext>` in natural order. The
    /// archive is removed on success and kept on failure.
    pub async fn expand_archive(&self, device_id: &DeviceId, zip_name: &str) -> Result<u32> {
        if !zip_name.to_ascii_lowercase().ends_with(".zip") {
            return Err(Error::Validation(format!("'{zip_name}' is not an archive")));
        }
        let archive = self.registry.get_asset(device_id, zip_name).await?;
        let device = self.registry.get_device(device_id).await?;
        let dir = self.registry.device_dir(&device);

        let folder_name = zip_name
            .rsplit_once('.')
            .map_or(zip_name, |(s, _)| s)
            .to_string();
        if self.registry.get_asset(device_id, &folder_name).await.is_ok() {
            return Err(Error::AlreadyExists(format!(
                "asset '{folder_name}' on device '{}'",
                device_id.as_str()
            )));
        }

        let status = self.registry.status_tracker();
        status.set(device_id, zip_name, ProcessingStatus::checking());
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::ProcessingStarted {
                device_id: device_id.clone(),
                file: zip_name.to_string(),
                timestamp: Utc::now(),
            },
        );

        let staging = dir.join(format!(".unzip_tmp_{}", Utc::now().timestamp_millis()));
        let result = self
            .expand_into(&archive, &staging, &dir.join(&folder_name))
            .await;
        let _ = fs::remove_dir_all(&staging).await;

        match result {
            Ok(count) => {
                self.registry
                    .asset_store()
                    .remove(device_id, zip_name)
                    .await?;
                status.clear(device_id, zip_name);

                let mut folder = Asset::new(
                    device_id.clone(),
                    &folder_name,
                    archive.original_name.clone(),
                    dir.join(&folder_name),
                    archive.size,
                );
                folder.content_hash = archive.content_hash.clone();
                let folder = self.registry.asset_store().upsert(folder).await?;

                info!(
                    device_id = %device_id.as_str(),
                    archive = %zip_name,
                    images = count,
                    "archive expanded"
                );
                self.hub.broadcast_device(
                    device_id,
                    DeviceEvent::FileReady {
                        device_id: device_id.clone(),
                        file: folder.name,
                        pages: Some(count),
                        timestamp: Utc::now(),
                    },
                );
                self.hub.publish(DeviceEvent::DevicesChanged {
                    timestamp: Utc::now(),
                });
                Ok(count)
            }
            Err(err) => {
                status.set(device_id, zip_name, ProcessingStatus::error(err.to_string(), false));
                self.hub.broadcast_device(
                    device_id,
                    DeviceEvent::FileError {
                        device_id: device_id.clone(),
                        file: zip_name.to_string(),
                        reason: err.to_string(),
                        timestamp: Utc::now(),
                    },
                );
                Err(err)
            }
        }
    }

    async fn expand_into(&self, archive: &Asset, staging: &Path, target: &Path) -> Result<u32> {
        fs::create_dir_all(staging).await?;
        self.extractor.extract(&archive.path, staging).await?;

        let mut images = list_files(staging, is_image_name).await?;
        if images.is_empty() {
            return Err(Error::Validation(format!(
                "'{}' contains no images",
                archive.name
            )));
        }
        images.sort_by(|a, b| natural_cmp(a, b));

        fs::create_dir_all(target).await?;
        for (index, name) in images.iter().enumerate() {
            let ext = name
                .rsplit_once('.')
                .map_or("png", |(_, e)| e)
                .to_ascii_lowercase();
            let numbered = format!("image_{:04}.{ext}", index + 1);
            fs::rename(staging.join(name), target.join(numbered)).await?;
        }

        fs::remove_file(&archive.path).await?;
        Ok(u32::try_from(images.len()).unwrap_or(u32::MAX))
    }
}

fn is_image_name(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

async fn list_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<String>> {
    if !fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

async fn count_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<u32> {
    let files = list_files(dir, keep).await?;
    Ok(u32::try_from(files.len()).unwrap_or(u32::MAX))
}

/// Compare names digit-run aware, so `page-2` sorts before `page-10`.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ln = take_number(&mut left);
                let rn = take_number(&mut right);
                match ln.cmp(&rn) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            (Some(l), Some(r)) => {
                match l.cmp(&r) {
                    Ordering::Equal => {
                        left.next();
                        right.next();
                    }
                    other => return other,
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u64 {
    let mut value = 0u64;
    while let Some(c) = chars.peek().copied() {
        if let Some(digit) = c.to_digit(10) {
            value = value.saturating_mul(10).saturating_add(u64::from(digit));
            chars.next();
        } else {
            break;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingPhase;
    use crate::test_helpers::{write_file, FailingRenderer, StubRenderer, TestHarness};

    #[test]
    fn natural_order_sorts_digit_runs() {
        let mut names = vec!["page-10.png", "page-2.png", "page-1.png"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["page-1.png", "page-2.png", "page-10.png"]);
    }

    #[tokio::test]
    async fn conversion_is_idempotent() {
        let harness = TestHarness::new().await;
        let renderer = Arc::new(StubRenderer::with_pages(4));
        let service = harness.conversion_with(renderer.clone());

        let doc = write_file(&harness.device_dir(), "deck.pdf", b"%PDF-fake");
        harness.upsert_asset("deck.pdf", doc, 9).await;

        let id = &harness.device_id;
        assert_eq!(service.convert(id, "deck.pdf").await.unwrap(), 4);
        assert_eq!(service.convert(id, "deck.pdf").await.unwrap(), 4);
        assert_eq!(renderer.rasterize_calls(), 1, "no re-render");
        assert_eq!(service.page_count(id, "deck.pdf").await.unwrap(), 4);

        // Directory-backed from now on.
        let asset = harness.registry.get_asset(id, "deck.pdf").await.unwrap();
        assert!(asset.path.is_dir());
        assert!(asset.path.join("deck.pdf").is_file());
        assert!(asset.path.join(PAGES_DIR).join("page_0001.png").is_file());
    }

    #[tokio::test]
    async fn slide_decks_render_via_intermediate_pdf() {
        let harness = TestHarness::new().await;
        let renderer = Arc::new(StubRenderer::with_pages(2));
        let service = harness.conversion_with(renderer.clone());

        let doc = write_file(&harness.device_dir(), "talk.pptx", b"pk-fake");
        harness.upsert_asset("talk.pptx", doc, 7).await;

        assert_eq!(service.convert(&harness.device_id, "talk.pptx").await.unwrap(), 2);
        assert_eq!(renderer.to_pdf_calls(), 1);

        let pages = harness.device_dir().join("talk").join(PAGES_DIR);
        assert!(pages.join("page_0002.png").is_file());
        assert!(!pages.join("talk.pdf").exists(), "intermediate pdf dropped");
    }

    #[tokio::test]
    async fn failure_rolls_the_document_back() {
        let harness = TestHarness::new().await;
        let service = harness.conversion_with(Arc::new(FailingRenderer));

        let doc = write_file(&harness.device_dir(), "deck.pdf", b"%PDF-fake");
        harness.upsert_asset("deck.pdf", doc.clone(), 9).await;

        let err = service.convert(&harness.device_id, "deck.pdf").await;
        assert!(err.is_err());
        assert!(doc.is_file(), "original restored to its pre-conversion spot");

        let status = harness.status.get(&harness.device_id, "deck.pdf");
        assert_eq!(status.phase, ProcessingPhase::Error);
        assert!(status.can_play);

        // Retry on next access succeeds with a working renderer.
        let service = harness.conversion_with(Arc::new(StubRenderer::with_pages(3)));
        assert_eq!(service.convert(&harness.device_id, "deck.pdf").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn archive_expansion_builds_an_ordered_image_folder() {
        let harness = TestHarness::new().await;
        let service = harness.conversion_with(Arc::new(StubRenderer::with_pages(0)));

        let zip = write_file(&harness.device_dir(), "trip.zip", b"PK-fake");
        harness.upsert_asset("trip.zip", zip.clone(), 7).await;

        let count = service.expand_archive(&harness.device_id, "trip.zip").await.unwrap();
        assert_eq!(count, 3, "only image entries survive");

        let folder = harness.device_dir().join("trip");
        assert!(folder.join("image_0001.jpg").is_file());
        assert!(folder.join("image_0003.png").is_file());
        assert!(!zip.exists(), "archive removed after expansion");
        assert!(harness.registry.get_asset(&harness.device_id, "trip.zip").await.is_err());

        let folder_asset = harness.registry.get_asset(&harness.device_id, "trip").await.unwrap();
        assert_eq!(MediaKind::from_name(&folder_asset.name), MediaKind::ImageFolder);
        assert_eq!(service.page_count(&harness.device_id, "trip").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn folder_page_image_indexes_the_listed_files() {
        let harness = TestHarness::new().await;
        let service = harness.conversion_with(Arc::new(StubRenderer::with_pages(0)));

        let folder = harness.device_dir().join("walk");
        for name in ["shot-1.jpg", "shot-2.jpg", "shot-10.jpg"] {
            write_file(&folder, name, b"jpg");
        }
        harness.upsert_asset("walk", folder.clone(), 3).await;

        let id = &harness.device_id;
        let last = service.page_image(id, "walk", 99).await.unwrap();
        assert!(last.ends_with("walk/shot-10.jpg"), "out-of-range clamps to the last file");
        let first = service.page_image(id, "walk", 0).await.unwrap();
        assert!(first.ends_with("walk/shot-1.jpg"));

        // Files gone from under the asset surface as not-found, never a panic.
        std::fs::remove_dir_all(&folder).unwrap();
        assert!(service.page_image(id, "walk", 1).await.is_err());
    }

    #[tokio::test]
    async fn failed_expansion_keeps_the_archive() {
        let harness = TestHarness::new().await;
        let service = harness.conversion_with(Arc::new(FailingRenderer));

        let zip = write_file(&harness.device_dir(), "trip.zip", b"PK-fake");
        harness.upsert_asset("trip.zip", zip.clone(), 7).await;

        assert!(service.expand_archive(&harness.device_id, "trip.zip").await.is_err());
        assert!(zip.exists());
        assert_eq!(
            harness.status.get(&harness.device_id, "trip.zip").phase,
            ProcessingPhase::Error
        );
    }
}
