//! Media inspection via an external prober, with an mtime-keyed result cache.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::models::MediaInfo;
use crate::{Error, Result};

/// Seam for media inspection so the pipeline is testable without ffprobe.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

const PROBE_CACHE_CAPACITY: u64 = 1024;

/// `ffprobe`-backed prober. Results are cached by `(path, mtime)` so repeated
/// decisions for an unchanged file never re-spawn the tool.
pub struct FfprobeProber {
    bin: String,
    cache: moka::sync::Cache<(PathBuf, i64), MediaInfo>,
}

impl FfprobeProber {
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            cache: moka::sync::Cache::new(PROBE_CACHE_CAPACITY),
        }
    }

    async fn run(&self, path: &Path) -> Result<MediaInfo> {
        let output = Command::new(&self.bin)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::external_tool("ffprobe", format!("failed to spawn: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::external_tool(
                "ffprobe",
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }

        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
        Ok(parsed.into_media_info())
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let meta = tokio::fs::metadata(path).await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(0));

        let key = (path.to_path_buf(), mtime);
        if let Some(hit) = self.cache.get(&key) {
            debug!(path = %path.display(), "probe cache hit");
            return Ok(hit);
        }

        let info = self.run(path).await?;
        self.cache.insert(key, info.clone());
        Ok(info)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    profile: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    bit_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl ProbeOutput {
    fn into_media_info(self) -> MediaInfo {
        let mut info = MediaInfo::default();

        for stream in &self.streams {
            match stream.codec_type.as_deref() {
                Some("video") => {
                    info.width = stream.width;
                    info.height = stream.height;
                    info.video_codec = stream.codec_name.clone();
                    info.video_profile = stream.profile.clone();
                    info.fps = stream
                        .avg_frame_rate
                        .as_deref()
                        .and_then(parse_fps)
                        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_fps));
                    info.video_bitrate = stream.bit_rate.as_deref().and_then(|b| b.parse().ok());
                }
                Some("audio") => {
                    info.audio_codec = stream.codec_name.clone();
                    info.audio_bitrate = stream.bit_rate.as_deref().and_then(|b| b.parse().ok());
                    info.audio_channels = stream.channels;
                }
                _ => {}
            }
        }

        if let Some(format) = &self.format {
            info.duration_secs = format.duration.as_deref().and_then(|d| d.parse().ok());
            // Some containers only report an overall bitrate.
            if info.video_bitrate.is_none() {
                info.video_bitrate = format.bit_rate.as_deref().and_then(|b| b.parse().ok());
            }
        }
        info
    }
}

/// ffprobe reports frame rates as fractions like `30000/1001`.
fn parse_fps(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some(num / den)
}
