//! sentryd - camera surveillance daemon
//!
//! This daemon:
//! 1. Loads the engine configuration (JSON file + SENTRY_* env overrides)
//! 2. Builds the standard dependency wiring (SQLite repository, sendmail
//!    transport, dashboard client, stub/tract detection backends)
//! 3. Registers one pipeline for the configured camera device
//! 4. Drives the preview stream, optionally mirroring it to a file
//! 5. Tears the registry down deterministically on Ctrl-C

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use sentry_engine::{EngineConfig, PipelineDeps, PipelineRegistry};

#[derive(Parser, Debug)]
#[command(name = "sentryd", version, about = "Real-time camera surveillance daemon")]
struct Args {
    /// JSON config file (falls back to the SENTRY_CONFIG env var).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Camera device override (e.g. /dev/video0 or stub://front_door).
    #[arg(long)]
    device: Option<String>,

    /// Mirror the latest preview JPEG to this path.
    #[arg(long)]
    preview: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from(Some(path))?,
        None => EngineConfig::load()?,
    };
    if let Some(device) = args.device {
        config.camera.device = device;
    }

    std::fs::create_dir_all(&config.media_dir)
        .with_context(|| format!("create media dir {}", config.media_dir.display()))?;
    if !config.recognition.gallery_dir.exists() {
        log::warn!(
            "gallery dir {} missing, creating an empty one",
            config.recognition.gallery_dir.display()
        );
        std::fs::create_dir_all(&config.recognition.gallery_dir)?;
    }

    let deps = PipelineDeps::from_config(&config)?;
    let mut registry = PipelineRegistry::new();
    registry.add(&config, deps)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install ctrl-c handler")?;

    let device = config.camera.device.clone();
    log::info!("sentryd running. camera={} db={}", device, config.db_path);

    let frame_pause = Duration::from_millis(1000 / config.camera.target_fps.max(1) as u64);
    let mut frames_served = 0u64;
    let mut last_health_log = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        if let Some(jpeg) = registry.get_frame(&device) {
            frames_served += 1;
            if let Some(preview) = &args.preview {
                if let Err(e) = std::fs::write(preview, &jpeg) {
                    log::warn!("preview write failed: {}", e);
                }
            }
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let capturing = registry
                .get(&device)
                .map(|p| p.is_capturing())
                .unwrap_or(false);
            log::info!(
                "camera health={} frames_served={}",
                capturing,
                frames_served
            );
            last_health_log = Instant::now();
        }

        std::thread::sleep(frame_pause);
    }

    log::info!("shutting down");
    registry.shutdown();
    Ok(())
}
