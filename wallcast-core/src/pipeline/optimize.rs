//! Video compatibility: decide whether an asset fits the playback profile and
//! transcode it to constrained H.264/AAC MP4 when it does not.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OptimizationConfig;
use crate::events::DeviceEvent;
use crate::hub::EventHub;
use crate::models::{DeviceId, MediaInfo, MediaKind, ProcessingStatus};
use crate::pipeline::probe::MediaProber;
use crate::service::registry::DeviceRegistry;
use crate::{Error, Result};

/// Externally visible progress stays inside this band; the edges are reserved
/// for the checking and finalizing phases.
const PROGRESS_FLOOR: u8 = 10;
const PROGRESS_CEIL: u8 = 90;

/// Resolution bands a transcode may target, largest first. Downscale-only:
/// the selected band never exceeds the source.
const TARGET_BANDS: &[TargetProfile] = &[
    TargetProfile {
        width: 1920,
        height: 1080,
        video_bitrate: 6_000_000,
        audio_bitrate: 192_000,
    },
    TargetProfile {
        width: 1280,
        height: 720,
        video_bitrate: 3_500_000,
        audio_bitrate: 128_000,
    },
    TargetProfile {
        width: 854,
        height: 480,
        video_bitrate: 1_800_000,
        audio_bitrate: 128_000,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetProfile {
    pub width: u32,
    pub height: u32,
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
}

/// Pure threshold decision: identical parameters and thresholds always yield
/// the same answer.
#[must_use]
pub fn needs_optimization(media: &MediaInfo, config: &OptimizationConfig) -> bool {
    if !config.enabled {
        return false;
    }
    if media.video_codec.as_deref() != Some("h264") {
        return true;
    }
    if media.video_profile.as_deref().is_some_and(|profile| {
        let p = profile.to_ascii_lowercase();
        p.contains("10") || p.contains("4:2:2") || p.contains("4:4:4")
    }) {
        return true;
    }
    media.width.unwrap_or(0) > config.max_width
        || media.height.unwrap_or(0) > config.max_height
        || media.fps.unwrap_or(0.0) > config.max_fps
        || media.video_bitrate.unwrap_or(0) > config.max_bitrate
}

/// Pick the target by the source's resolution band, never upscaling and never
/// exceeding the configured ceiling.
#[must_use]
pub fn target_profile(media: &MediaInfo, config: &OptimizationConfig) -> TargetProfile {
    let source_height = media.height.unwrap_or(config.max_height);
    let ceiling = config.max_height.min(source_height);

    let band = TARGET_BANDS
        .iter()
        .find(|band| band.height <= ceiling)
        .copied()
        .unwrap_or(TARGET_BANDS[TARGET_BANDS.len() - 1]);
    TargetProfile {
        video_bitrate: band.video_bitrate.min(config.max_bitrate),
        ..band
    }
}

/// Seam over the external transcoder. Implementations report the current
/// stream position in seconds through `progress` and must honor `cancel` by
/// killing the child process.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &TargetProfile,
        max_fps: f64,
        progress: mpsc::UnboundedSender<f64>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

static OUT_TIME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^out_time=(\d+):(\d{2}):(\d{2})(?:\.(\d+))?").unwrap()
});

/// `ffmpeg`-backed engine using `-progress pipe:1` for a structured progress
/// stream on stdout.
pub struct FfmpegEngine {
    bin: String,
}

impl FfmpegEngine {
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn parse_out_time(line: &str) -> Option<f64> {
        let caps = OUT_TIME.captures(line)?;
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        let fraction = caps
            .get(4)
            .and_then(|m| format!("0.{}", m.as_str()).parse::<f64>().ok())
            .unwrap_or(0.0);
        Some(hours * 3600.0 + minutes * 60.0 + seconds + fraction)
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &TargetProfile,
        max_fps: f64,
        progress: mpsc::UnboundedSender<f64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut child = Command::new(&self.bin)
            .args(["-y", "-hide_banner", "-nostdin", "-i"])
            .arg(input)
            .args([
                "-vf",
                &format!("scale={}:-2", profile.width),
                "-r",
                &format!("{max_fps}"),
                "-c:v",
                "libx264",
                "-profile:v",
                "high",
                "-pix_fmt",
                "yuv420p",
                "-b:v",
                &profile.video_bitrate.to_string(),
                "-maxrate",
                &profile.video_bitrate.to_string(),
                "-bufsize",
                &(profile.video_bitrate * 2).to_string(),
                "-c:a",
                "aac",
                "-b:a",
                &profile.audio_bitrate.to_string(),
                "-movflags",
                "+faststart",
                "-progress",
                "pipe:1",
            ])
            .arg(output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::external_tool("ffmpeg", format!("failed to spawn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::external_tool("ffmpeg", "no stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::external_tool("ffmpeg", "no stderr pipe"))?;

        // Keep a short stderr tail for the failure reason.
        let tail = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() >= 8 {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(Error::external_tool("ffmpeg", "cancelled before completion"));
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(position) = Self::parse_out_time(&line) {
                                let _ = progress.send(position);
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "failed reading ffmpeg progress");
                            break;
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            let tail = tail.await.unwrap_or_default().join(" | ");
            Err(Error::external_tool("ffmpeg", format!("{status}: {tail}")))
        }
    }
}

/// Human-readable reasons for known failure causes; everything else passes
/// through raw.
fn friendly_reason(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("cancelled") {
        "transcode cancelled".to_string()
    } else if lower.contains("deadline") {
        "transcode deadline exceeded".to_string()
    } else if lower.contains("unknown encoder") {
        "required encoder is not available".to_string()
    } else if lower.contains("decoder") || lower.contains("invalid data found") {
        "unsupported source codec".to_string()
    } else {
        raw.to_string()
    }
}

/// Ensures video assets meet the compatibility profile, transcoding through
/// a temp file and swapping it into place on success. Different assets may
/// transcode concurrently; the same asset is serialized by a per-asset lock.
#[derive(Clone)]
pub struct OptimizeService {
    registry: DeviceRegistry,
    prober: Arc<dyn MediaProber>,
    engine: Arc<dyn TranscodeEngine>,
    hub: EventHub,
    config: OptimizationConfig,
    locks: Arc<DashMap<(DeviceId, String), Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl OptimizeService {
    #[must_use]
    pub fn new(
        registry: DeviceRegistry,
        prober: Arc<dyn MediaProber>,
        engine: Arc<dyn TranscodeEngine>,
        hub: EventHub,
        config: OptimizationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            prober,
            engine,
            hub,
            config,
            locks: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Bring one video asset within the compatibility profile. Returns the
    /// asset's final storage name, which changes to an `.mp4` sibling when
    /// the container had to change.
    pub async fn optimize(&self, device_id: &DeviceId, name: &str) -> Result<String> {
        if !MediaKind::from_name(name).is_video() {
            return Err(Error::Validation(format!("'{name}' is not a video")));
        }

        // Per-asset guard: a second caller blocks here, then re-checks the
        // thresholds below and finds no work.
        let key = (device_id.clone(), name.to_string());
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;
        let result = self.optimize_locked(device_id, name).await;
        drop(guard);
        // Waiters hold their own clone of the entry; prune only when nobody
        // else does.
        self.locks
            .remove_if(&key, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    async fn optimize_locked(&self, device_id: &DeviceId, name: &str) -> Result<String> {
        let asset = self.registry.get_asset(device_id, name).await?;
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

        let media = match &asset.media {
            Some(media) => media.clone(),
            None => match self.prober.probe(&asset.path).await {
                Ok(media) => media,
                Err(err) => {
                    let reason = friendly_reason(&err.to_string());
                    status.set(device_id, name, ProcessingStatus::error(reason.clone(), true));
                    self.broadcast_error(device_id, name, &reason);
                    return Err(err);
                }
            },
        };

        if !needs_optimization(&media, &self.config) {
            debug!(device_id = %device_id.as_str(), file = %name, "within profile, no transcode");
            status.set(device_id, name, ProcessingStatus::ready());
            self.broadcast_ready(device_id, name);
            return Ok(name.to_string());
        }

        let profile = target_profile(&media, &self.config);
        info!(
            device_id = %device_id.as_str(),
            file = %name,
            target_width = profile.width,
            target_height = profile.height,
            "transcoding"
        );

        let device = self.registry.get_device(device_id).await?;
        let device_dir = self.registry.device_dir(&device);
        let temp = device_dir.join(format!(
            ".optimizing_{}.mp4",
            Utc::now().timestamp_millis()
        ));

        let progress_task = self.spawn_progress_task(device_id, name, media.duration_secs);
        let result = self
            .run_bounded(&asset.path, &temp, &profile, progress_task.sender)
            .await;
        let _ = progress_task.handle.await;

        // Finalization failures take the same path as engine failures, so
        // the status never sticks at a processing phase.
        let finalized = match result {
            Ok(()) => self.finalize(device_id, &asset, &temp).await,
            Err(err) => Err(err),
        };

        match finalized {
            Ok(final_name) => {
                status.rename(device_id, name, &final_name);
                status.set(device_id, &final_name, ProcessingStatus::ready());
                self.broadcast_ready(device_id, &final_name);
                self.hub.publish(DeviceEvent::DevicesChanged {
                    timestamp: Utc::now(),
                });
                Ok(final_name)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                let reason = friendly_reason(&err.to_string());
                // Original bytes untouched, so the asset stays playable.
                status.set(device_id, name, ProcessingStatus::error(reason.clone(), true));
                self.broadcast_error(device_id, name, &reason);
                Err(err)
            }
        }
    }

    /// Run the engine under the configured deadline; the deadline cancels the
    /// child through the token.
    async fn run_bounded(
        &self,
        input: &Path,
        output: &Path,
        profile: &TargetProfile,
        progress: mpsc::UnboundedSender<f64>,
    ) -> Result<()> {
        let token = self.shutdown.child_token();
        let deadline = Duration::from_secs(self.config.transcode_deadline_secs);
        tokio::select! {
            result = self.engine.transcode(
                input,
                output,
                profile,
                self.config.max_fps,
                progress,
                token.clone(),
            ) => result,
            () = tokio::time::sleep(deadline) => {
                token.cancel();
                Err(Error::external_tool("ffmpeg", "transcode deadline exceeded"))
            }
        }
    }

    /// Swap the transcoded output into place. The record moves first, so a
    /// naming failure leaves the original asset fully intact. Deletes the
    /// original only when this record was its sole referrer; shared bytes
    /// stay for the other devices.
    async fn finalize(
        &self,
        device_id: &DeviceId,
        asset: &crate::models::Asset,
        temp: &Path,
    ) -> Result<String> {
        let store = self.registry.asset_store();
        let device = self.registry.get_device(device_id).await?;
        let device_dir = self.registry.device_dir(&device);
        let referrers = store.path_referrers(&asset.path).await?;

        let final_name = self
            .output_name(device_id, asset, referrers, &device_dir)
            .await;
        let final_path = device_dir.join(&final_name);

        let mut record = if final_name == asset.name {
            asset.clone()
        } else {
            store.rename(device_id, &asset.name, &final_name).await?
        };

        fs::rename(temp, &final_path).await?;
        if referrers <= 1 && asset.path != final_path {
            let _ = fs::remove_file(&asset.path).await;
        }

        record.path = final_path.clone();
        record.mime = crate::models::mime_for_name(&final_name).to_string();
        record.size = fs::metadata(&final_path).await?.len();
        record.modified_at = Utc::now();
        // Content changed: old hashes no longer identify these bytes.
        record.content_hash = None;
        record.partial_hash = None;
        record.media = self.prober.probe(&final_path).await.ok();
        store.upsert(record).await?;

        // Keep any in-flight playback pointed at the renamed asset.
        if final_name != asset.name {
            let old = asset.name.clone();
            let new = final_name.clone();
            self.registry
                .update_playback(device_id, |state| {
                    if state.asset.as_deref() == Some(old.as_str()) {
                        state.asset = Some(new);
                    }
                })
                .await?;
        }
        Ok(final_name)
    }

    /// Storage name the transcoded output lands under. A container change
    /// targets the `.mp4` sibling; when that name belongs to a different
    /// asset, or the bytes in place are still referenced by other records,
    /// a short random suffix keeps the output clear of them.
    async fn output_name(
        &self,
        device_id: &DeviceId,
        asset: &crate::models::Asset,
        referrers: usize,
        device_dir: &Path,
    ) -> String {
        let stem = asset
            .name
            .rsplit_once('.')
            .map_or(asset.name.as_str(), |(s, _)| s);
        let plain = format!("{stem}.mp4");

        let taken = if plain == asset.name {
            device_dir.join(&plain) == asset.path && referrers > 1
        } else {
            self.registry.get_asset(device_id, &plain).await.is_ok()
        };

        if taken {
            format!("{stem}_{}.mp4", nanoid::nanoid!(6))
        } else {
            plain
        }
    }

    fn spawn_progress_task(
        &self,
        device_id: &DeviceId,
        name: &str,
        duration_secs: Option<f64>,
    ) -> ProgressTask {
        let (tx, mut rx) = mpsc::unbounded_channel::<f64>();
        let hub = self.hub.clone();
        let status = self.registry.status_tracker();
        let device_id = device_id.clone();
        let name = name.to_string();
        let step = self.config.progress_step.max(1);

        let handle = tokio::spawn(async move {
            let mut last = PROGRESS_FLOOR;
            status.set(&device_id, &name, ProcessingStatus::processing(last, true));
            hub.broadcast_device(
                &device_id,
                DeviceEvent::ProcessingProgress {
                    device_id: device_id.clone(),
                    file: name.clone(),
                    progress: last,
                    timestamp: Utc::now(),
                },
            );

            while let Some(position) = rx.recv().await {
                let Some(total) = duration_secs.filter(|d| *d > 0.0) else {
                    continue;
                };
                let fraction = (position / total).clamp(0.0, 1.0);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let pct = (f64::from(PROGRESS_FLOOR)
                    + fraction * f64::from(PROGRESS_CEIL - PROGRESS_FLOOR))
                    as u8;
                // Coarse, non-decreasing pushes bound the event volume.
                if pct >= last.saturating_add(step) {
                    last = pct.min(PROGRESS_CEIL);
                    status.set(&device_id, &name, ProcessingStatus::processing(last, true));
                    hub.broadcast_device(
                        &device_id,
                        DeviceEvent::ProcessingProgress {
                            device_id: device_id.clone(),
                            file: name.clone(),
                            progress: last,
                            timestamp: Utc::now(),
                        },
                    );
                }
            }
        });
        ProgressTask { sender: tx, handle }
    }

    fn broadcast_ready(&self, device_id: &DeviceId, name: &str) {
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::FileReady {
                device_id: device_id.clone(),
                file: name.to_string(),
                pages: None,
                timestamp: Utc::now(),
            },
        );
    }

    fn broadcast_error(&self, device_id: &DeviceId, name: &str, reason: &str) {
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::FileError {
                device_id: device_id.clone(),
                file: name.to_string(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        );
    }
}

struct ProgressTask {
    sender: mpsc::UnboundedSender<f64>,
    handle: tokio::task::JoinHandle<()>,
}
