//! viewd - fisheye multi-view production daemon
//!
//! This daemon:
//! 1. Loads the source list (file + environment overrides)
//! 2. Starts one production loop per source
//! 3. Keeps every source's latest snapshot in the shared frame buffers
//! 4. Logs per-source health until interrupted

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fisheye_views::config::ViewdConfig;
use fisheye_views::ingest::default_source_factory;
use fisheye_views::{FrameBuffers, ProducerRegistry, StartOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FISHEYE_CONFIG")]
    config: Option<PathBuf>,
    /// Seconds between health log lines.
    #[arg(long, default_value_t = 5)]
    health_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.health_secs == 0 {
        return Err(anyhow!("health interval must be >= 1 second"));
    }
    let cfg = ViewdConfig::load_from(args.config.as_deref())?;

    let buffers = Arc::new(FrameBuffers::new());
    let registry = ProducerRegistry::new();
    let ctx = cfg.producer_context(Arc::clone(&buffers))?;
    let sources = default_source_factory();

    log::info!(
        "viewd starting: {} sources, remap {}x{}, stream {}x{} q{}",
        cfg.sources.len(),
        cfg.remap_size.0,
        cfg.remap_size.1,
        cfg.stream.width,
        cfg.stream.height,
        cfg.stream.jpeg_quality
    );
    for spec in &cfg.sources {
        match registry.start(spec.clone(), ctx.clone(), Arc::clone(&sources)) {
            Ok(StartOutcome::Started) => log::info!(
                "source {} -> {} ({} views, gpu={})",
                spec.id,
                spec.path,
                spec.views.len(),
                spec.gpu
            ),
            Ok(StartOutcome::AlreadyRunning) => {
                log::warn!("source {} listed twice; already running", spec.id)
            }
            Err(e) => log::error!("source {} not started: {:#}", spec.id, e),
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))?;

    let health_interval = Duration::from_secs(args.health_secs);
    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last_health_log.elapsed() < health_interval {
            continue;
        }
        last_health_log = Instant::now();
        for spec in &cfg.sources {
            match registry.status(&spec.id) {
                Some(status) => log::info!(
                    "{} state={:?} backend={} fps={:.1} published={} skipped={} last_error={}",
                    spec.id,
                    status.state,
                    status.backend.unwrap_or("-"),
                    status.fps,
                    status.published,
                    status.skipped,
                    status
                        .last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "none".to_string())
                ),
                None => log::warn!("{} not running", spec.id),
            }
        }
        if registry.active_sources().is_empty() {
            return Err(anyhow!("no source is running"));
        }
    }

    log::info!("viewd shutting down");
    Ok(())
}
