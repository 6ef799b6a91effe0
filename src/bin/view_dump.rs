//! view_dump - run one source and write a delivered view to JPEG files

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fisheye_views::config::ViewdConfig;
use fisheye_views::ingest::default_source_factory;
use fisheye_views::view::default_ring;
use fisheye_views::{
    DeliveryChannel, FrameBuffers, ProducerRegistry, SourceSpec, StreamBindings, ViewKey,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Source path or stub:// URL.
    #[arg(long, default_value = "stub://demo?frames=10&width=1280&height=720&fps=10")]
    source: String,
    /// View index to dump; -1 dumps the original frame.
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    view: i64,
    /// Number of views in the ring.
    #[arg(long, default_value_t = 8)]
    ring: usize,
    /// Ring tilt in degrees.
    #[arg(long, default_value_t = 35.0)]
    tilt: f64,
    /// Ring output field of view in degrees.
    #[arg(long, default_value_t = 80.0)]
    fov: f64,
    /// Frames to write.
    #[arg(long, default_value_t = 10)]
    frames: u64,
    /// Output directory.
    #[arg(long, default_value = "view_dump_out")]
    out: String,
    /// Skip drawing view footprints on the original frame.
    #[arg(long)]
    no_overlay: bool,
    /// Enable motion detection.
    #[arg(long)]
    motion: bool,
    /// Request the GPU backend.
    #[arg(long)]
    gpu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.frames == 0 {
        return Err(anyhow!("frames must be >= 1"));
    }
    let key = ViewKey::from_index(args.view)?;
    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("create output directory {}", out_dir.display()))?;

    let cfg = ViewdConfig::load()?;
    let buffers = Arc::new(FrameBuffers::new());
    let registry = ProducerRegistry::new();
    let spec = SourceSpec {
        views: default_ring(args.ring, args.tilt, args.fov),
        overlay: !args.no_overlay,
        motion_detection: args.motion,
        gpu: args.gpu,
        ..SourceSpec::new("dump", args.source.clone())
    };
    registry.start(
        spec,
        cfg.producer_context(Arc::clone(&buffers))?,
        default_source_factory(),
    )?;

    let bindings = StreamBindings::new();
    let camera_id = bindings.bind("dump", key)?;
    let binding = bindings
        .resolve(&camera_id)
        .ok_or_else(|| anyhow!("camera {} vanished", camera_id))?;

    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let channel = DeliveryChannel::new(Arc::clone(&buffers), binding.source_id, binding.key)
        .with_interval(cfg.client_interval)
        .spawn(tx);

    let mut written = 0u64;
    let mut last_sequence = 0u64;
    while written < args.frames {
        let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .map_err(|_| match registry.status("dump") {
                Some(status) => anyhow!("no frame within 10s (last error: {:?})", status.last_error),
                None => anyhow!("source {} stopped", args.source),
            })?
            .ok_or_else(|| anyhow!("delivery channel closed"))?;
        if frame.sequence == last_sequence {
            continue;
        }
        last_sequence = frame.sequence;
        let path = out_dir.join(format!("{}-{}-{:05}.jpg", camera_id, frame.key, frame.sequence));
        fs::write(&path, frame.image.bytes())
            .with_context(|| format!("write {}", path.display()))?;
        written += 1;
        log::info!(
            "wrote {} ({} bytes, fps {:.1}, wire message {} bytes)",
            path.display(),
            frame.image.len(),
            frame.fps,
            frame.to_json().len()
        );
    }

    drop(rx);
    let stats = channel.await?;
    bindings.unbind(&camera_id);
    log::info!(
        "done: {} frames written, {} delivered over {} polls",
        written,
        stats.delivered,
        stats.polls
    );
    Ok(())
}
