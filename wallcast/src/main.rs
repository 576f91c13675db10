use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wallcast_core::pipeline::{
    cleanup_stale_temps, ConversionService, ExternalRenderer, FfmpegEngine, FfprobeProber,
    IngestService, MediaPipeline, OptimizeService, StatusTracker,
};
use wallcast_core::repository::{MemoryAssetStore, MemoryDeviceStore};
use wallcast_core::service::{ControlService, DeviceRegistry, SessionManager};
use wallcast_core::{logging, Config, EventHub};

/// Fleet controller for networked playback devices.
#[derive(Debug, Parser)]
#[command(name = "wallcast", version, about)]
struct Cli {
    /// Path to a configuration file (TOML/YAML/JSON).
    #[arg(short, long, env = "WALLCAST_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (env overrides file overrides defaults)
    let config = Config::load(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("wallcast starting...");
    info!("storage root: {}", config.storage.root);

    // 3. Prepare storage and sweep leftovers of any interrupted run
    tokio::fs::create_dir_all(config.storage_root()).await?;
    let removed = cleanup_stale_temps(config.storage_root()).await?;
    if removed > 0 {
        info!(removed, "removed stale processing temps");
    }

    // 4. Wire the core services
    let shutdown = CancellationToken::new();
    let hub = EventHub::new();
    let status = StatusTracker::new();
    let registry = DeviceRegistry::new(
        Arc::new(MemoryDeviceStore::new()),
        Arc::new(MemoryAssetStore::new()),
        status,
        config.storage_root().to_path_buf(),
    );

    let prober = Arc::new(FfprobeProber::new(&config.optimization.ffprobe_bin));
    let renderer = Arc::new(ExternalRenderer::new(config.conversion.clone()));
    let conversion = ConversionService::new(
        registry.clone(),
        renderer.clone(),
        renderer,
        hub.clone(),
    );
    let optimization = OptimizeService::new(
        registry.clone(),
        prober.clone(),
        Arc::new(FfmpegEngine::new(&config.optimization.ffmpeg_bin)),
        hub.clone(),
        config.optimization.clone(),
        shutdown.clone(),
    );
    let ingest = IngestService::new(registry.clone(), prober, config.storage.clone());
    // Transports (HTTP/WebSocket) attach to these when embedded; the daemon
    // itself only keeps them alive.
    let _pipeline = MediaPipeline::new(ingest, conversion.clone(), optimization, hub.clone());
    let _control = ControlService::new(registry.clone(), conversion, hub.clone());
    let sessions = SessionManager::new(registry.clone(), hub.clone(), config.heartbeat_timeout());

    // 5. Start the heartbeat sweeper
    let sweeper = sessions.spawn_sweeper(config.sweep_interval(), shutdown.clone());
    info!(
        timeout_secs = config.presence.heartbeat_timeout_secs,
        interval_secs = config.presence.sweep_interval_secs,
        "heartbeat sweeper started"
    );

    let devices = registry.list_devices().await?;
    info!(devices = devices.len(), "wallcast ready");

    // 6. Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();
    if let Err(err) = sweeper.await {
        error!(error = %err, "sweeper task ended abnormally");
    }
    info!("wallcast stopped");
    Ok(())
}
