//! Frame production loop.
//!
//! One named thread per source runs acquisition, compositing, encoding and
//! pacing end to end. The registry guarantees at most one loop per source id:
//! a start request inserts the source's status entry only if it is vacant.
//!
//! Lifecycle: `Starting` → `Running`, or `Starting` → `Stopped` when the source
//! cannot be opened. A stopped producer removes its registry entry so the source
//! can be started again. A running loop never terminates; per-cycle failures
//! skip the cycle and leave the previous snapshot visible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::buffer::{FrameBuffers, Snapshot, SnapshotMeta};
use crate::compositor::{CompositorOptions, ViewCompositor};
use crate::detect::{background_subtractor_factory, DetectorFactory};
use crate::encode::{EncodedImage, FrameEncoder};
use crate::error::{PipelineError, Stage};
use crate::frame::SourceFrame;
use crate::ingest::{FrameSource, SourceFactory};
use crate::transform::select_backend;
use crate::view::{ViewConfig, ViewKey, ViewSelector};

/// Frame rate assumed for sources that do not declare one.
pub const DEFAULT_SOURCE_FPS: f64 = 30.0;
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Everything needed to run one source.
#[derive(Clone, Debug)]
pub struct SourceSpec {
    /// Registry key; also the snapshot buffer key.
    pub id: String,
    /// Local path or `stub://` URL handed to the source factory.
    pub path: String,
    /// Non-fisheye sources only publish the resized original frame.
    pub fisheye: bool,
    pub views: Vec<ViewConfig>,
    /// Outline each view's footprint on the original frame.
    pub overlay: bool,
    pub show_original: bool,
    pub motion_detection: bool,
    pub gpu: bool,
    /// On-device downscale target (width, height) for the GPU backend.
    pub downscale: Option<(u32, u32)>,
}

impl SourceSpec {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            fisheye: true,
            views: vec![ViewConfig::default()],
            overlay: true,
            show_original: true,
            motion_detection: false,
            gpu: false,
            downscale: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow!("source id cannot be empty"));
        }
        if self.path.trim().is_empty() {
            return Err(anyhow!("source '{}' has no path", self.id));
        }
        if self.fisheye && self.views.is_empty() {
            return Err(anyhow!("fisheye source '{}' has no views", self.id));
        }
        Ok(())
    }
}

/// Shared collaborators handed to every producer.
#[derive(Clone)]
pub struct ProducerContext {
    pub buffers: Arc<FrameBuffers>,
    pub encoder: FrameEncoder,
    pub compositor: CompositorOptions,
    pub detectors: DetectorFactory,
    pub observer: Arc<dyn CycleObserver>,
    pub fallback_fps: f64,
}

impl ProducerContext {
    pub fn new(buffers: Arc<FrameBuffers>) -> Self {
        Self {
            buffers,
            encoder: FrameEncoder::default(),
            compositor: CompositorOptions::default(),
            detectors: background_subtractor_factory(),
            observer: Arc::new(LogObserver),
            fallback_fps: DEFAULT_SOURCE_FPS,
        }
    }
}

/// Summary of one successful production cycle.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub sequence: u64,
    pub fps: f32,
    pub keys: Vec<ViewKey>,
    /// Views whose detector reported motion.
    pub motion: Vec<ViewKey>,
    pub elapsed: Duration,
}

/// Receives the typed outcome of every cycle.
pub trait CycleObserver: Send + Sync {
    fn on_cycle(&self, _source_id: &str, _report: &CycleReport) {}
    fn on_error(&self, source_id: &str, error: &PipelineError);
}

/// Default observer writing to the `log` facade.
pub struct LogObserver;

impl CycleObserver for LogObserver {
    fn on_cycle(&self, source_id: &str, report: &CycleReport) {
        if !report.motion.is_empty() {
            let keys: Vec<String> = report.motion.iter().map(|k| k.to_string()).collect();
            log::info!("{}: motion on {}", source_id, keys.join(","));
        }
        log::debug!(
            "{}: cycle {} published {} images in {:?}",
            source_id,
            report.sequence,
            report.keys.len(),
            report.elapsed
        );
    }

    fn on_error(&self, source_id: &str, error: &PipelineError) {
        match error {
            PipelineError::SourceUnavailable { .. } => log::error!("{}: {}", source_id, error),
            _ => log::warn!("{}: {}", source_id, error),
        }
    }
}

/// Rolling frame-rate measurement over 1-second windows.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    frames: u32,
    fps: f32,
}

impl FpsMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
            fps: 0.0,
        }
    }

    /// Counts one frame; closes the window once a second has elapsed.
    pub fn tick(&mut self, now: Instant) -> f32 {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            let fps = self.frames as f64 / elapsed.as_secs_f64();
            self.fps = ((fps * 10.0).round() / 10.0) as f32;
            self.frames = 0;
            self.window_start = now;
        }
        self.fps
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

/// Best-effort real-time pacing to a nominal frame interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pacer {
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_fps(fps: f64) -> Self {
        if fps.is_finite() && fps > 0.0 {
            Self::new(Duration::from_secs_f64(1.0 / fps))
        } else {
            Self::new(Duration::ZERO)
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Remaining sleep after a cycle that took `elapsed`; zero once the interval is exceeded.
    pub fn delay(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }

    pub fn pace(&self, elapsed: Duration) {
        let delay = self.delay(elapsed);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerState {
    Starting,
    Running,
    Stopped,
}

/// Live counters of one producer, shared with the registry.
#[derive(Debug)]
pub struct ProducerStatus {
    state: Mutex<ProducerState>,
    published: AtomicU64,
    skipped: AtomicU64,
    fps_bits: AtomicU32,
    last_error: Mutex<Option<PipelineError>>,
    backend: Mutex<Option<&'static str>>,
}

/// Point-in-time copy of a `ProducerStatus`.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub state: ProducerState,
    pub published: u64,
    pub skipped: u64,
    pub fps: f32,
    pub last_error: Option<PipelineError>,
    pub backend: Option<&'static str>,
}

impl ProducerStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProducerState::Starting),
            published: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            fps_bits: AtomicU32::new(0),
            last_error: Mutex::new(None),
            backend: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ProducerState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn set_backend(&self, name: &'static str) {
        if let Ok(mut guard) = self.backend.lock() {
            *guard = Some(name);
        }
    }

    fn record_published(&self, fps: f32) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    fn record_error(&self, error: PipelineError) {
        if matches!(error, PipelineError::TransientProcessing { .. }) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(error);
        }
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            state: self
                .state
                .lock()
                .map(|s| *s)
                .unwrap_or(ProducerState::Stopped),
            published: self.published.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            fps: f32::from_bits(self.fps_bits.load(Ordering::Relaxed)),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
            backend: self.backend.lock().ok().and_then(|b| *b),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

type Entries = Arc<DashMap<String, Arc<ProducerStatus>>>;

/// Registry of active producers keyed by source id.
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    entries: Entries,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a producer for `spec.id` unless one is already registered.
    pub fn start(
        &self,
        spec: SourceSpec,
        ctx: ProducerContext,
        sources: SourceFactory,
    ) -> Result<StartOutcome> {
        spec.validate()?;
        let status = Arc::new(ProducerStatus::new());
        match self.entries.entry(spec.id.clone()) {
            Entry::Occupied(_) => {
                log::debug!("producer {} already running", spec.id);
                return Ok(StartOutcome::AlreadyRunning);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&status));
            }
        }

        let entries = Arc::clone(&self.entries);
        let thread_status = Arc::clone(&status);
        let id = spec.id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("producer-{}", spec.id))
            .spawn(move || run_producer(spec, ctx, sources, thread_status, entries));
        if let Err(err) = spawned {
            deregister(&self.entries, &id, &status);
            return Err(err).with_context(|| format!("spawn producer thread for {}", id));
        }
        log::info!("producer {} started", id);
        Ok(StartOutcome::Started)
    }

    pub fn is_running(&self, source_id: &str) -> bool {
        self.entries.contains_key(source_id)
    }

    pub fn active_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn status(&self, source_id: &str) -> Option<StatusReport> {
        self.entries.get(source_id).map(|entry| entry.value().report())
    }
}

fn deregister(entries: &Entries, source_id: &str, status: &Arc<ProducerStatus>) {
    entries.remove_if(source_id, |_, current| Arc::ptr_eq(current, status));
}

/// Per-source compositing and encoding state, owned by the producer thread.
pub struct SourcePipeline {
    compositor: Option<ViewCompositor>,
    encoder: FrameEncoder,
    overlay: bool,
}

impl SourcePipeline {
    /// Builds the pipeline for a source whose frames are `frame_dims` (width, height).
    ///
    /// The transform backend is selected here, once.
    pub fn new(
        spec: &SourceSpec,
        ctx: &ProducerContext,
        frame_dims: (u32, u32),
    ) -> Result<(Self, Option<PipelineError>)> {
        if !spec.fisheye {
            return Ok((
                Self {
                    compositor: None,
                    encoder: ctx.encoder,
                    overlay: false,
                },
                None,
            ));
        }
        let selection = select_backend(spec.gpu, spec.downscale);
        let options = CompositorOptions {
            show_original: spec.show_original,
            ..ctx.compositor
        };
        let detectors = spec.motion_detection.then(|| Arc::clone(&ctx.detectors));
        let compositor = ViewCompositor::new(
            frame_dims,
            spec.views.clone(),
            options,
            selection.backend,
            detectors,
        )?;
        Ok((
            Self {
                compositor: Some(compositor),
                encoder: ctx.encoder,
                overlay: spec.overlay,
            },
            selection.fallback,
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        self.compositor
            .as_ref()
            .map(|c| c.backend_name())
            .unwrap_or("none")
    }

    pub fn compositor(&self) -> Option<&ViewCompositor> {
        self.compositor.as_ref()
    }

    /// Renders and encodes one frame into a complete snapshot.
    pub fn run_cycle(
        &mut self,
        frame: &SourceFrame,
        meta: SnapshotMeta,
    ) -> Result<(Snapshot, Vec<ViewKey>), PipelineError> {
        let Some(compositor) = self.compositor.as_mut() else {
            let image = self
                .encoder
                .encode(frame.image())
                .map_err(|e| PipelineError::transient(Stage::Encode, &e))?;
            let mut images = BTreeMap::new();
            images.insert(ViewKey::Original, image);
            return Ok((Snapshot { images, meta }, Vec::new()));
        };

        let output = compositor
            .render(frame, self.overlay, ViewSelector::All)
            .map_err(|e| PipelineError::transient(Stage::Composite, &e))?;

        let mut images: BTreeMap<ViewKey, EncodedImage> = BTreeMap::new();
        for (key, image) in &output.images {
            let encoded = self
                .encoder
                .encode(image)
                .with_context(|| format!("encode {}", key))
                .map_err(|e| PipelineError::transient(Stage::Encode, &e))?;
            images.insert(*key, encoded);
        }
        let motion = output
            .motion
            .iter()
            .filter(|(_, hit)| **hit)
            .map(|(key, _)| *key)
            .collect();
        Ok((Snapshot { images, meta }, motion))
    }
}

fn run_producer(
    spec: SourceSpec,
    ctx: ProducerContext,
    sources: SourceFactory,
    status: Arc<ProducerStatus>,
    entries: Entries,
) {
    let abort = |error: PipelineError| {
        ctx.observer.on_error(&spec.id, &error);
        status.record_error(error);
        status.set_state(ProducerState::Stopped);
        deregister(&entries, &spec.id, &status);
    };

    let mut source = match sources(&spec.path).and_then(|mut source| {
        source.open()?;
        Ok(source)
    }) {
        Ok(source) => source,
        Err(err) => {
            abort(PipelineError::source_unavailable(&spec.id, format!("{:#}", err)));
            return;
        }
    };

    let Some(frame_dims) = source.dimensions() else {
        abort(PipelineError::source_unavailable(
            &spec.id,
            "source did not report frame dimensions",
        ));
        return;
    };

    let mut pipeline = match SourcePipeline::new(&spec, &ctx, frame_dims) {
        Ok((pipeline, fallback)) => {
            if let Some(err) = fallback {
                ctx.observer.on_error(&spec.id, &err);
                status.record_error(err);
            }
            pipeline
        }
        Err(err) => {
            abort(PipelineError::source_unavailable(&spec.id, format!("{:#}", err)));
            return;
        }
    };
    if let Some(compositor) = pipeline.compositor() {
        for err in compositor.configuration_errors() {
            ctx.observer.on_error(&spec.id, err);
            status.record_error(err.clone());
        }
    }

    let fps = source.nominal_fps().unwrap_or(ctx.fallback_fps);
    let pacer = Pacer::from_fps(fps);
    status.set_backend(pipeline.backend_name());
    status.set_state(ProducerState::Running);
    log::info!(
        "producer {}: {}x{} at {:.1} fps (interval {:?}, {} backend)",
        spec.id,
        frame_dims.0,
        frame_dims.1,
        fps,
        pacer.interval(),
        pipeline.backend_name()
    );

    run_loop(&spec, &ctx, source.as_mut(), &mut pipeline, pacer, &status);
}

fn run_loop(
    spec: &SourceSpec,
    ctx: &ProducerContext,
    source: &mut dyn FrameSource,
    pipeline: &mut SourcePipeline,
    pacer: Pacer,
    status: &ProducerStatus,
) {
    let mut meter = FpsMeter::new(Instant::now());
    let mut sequence = 0u64;
    let mut just_rewound = false;
    let mut last_health_log = Instant::now();

    loop {
        let started = Instant::now();
        let frame = match source.read_frame() {
            Ok(Some(frame)) => {
                just_rewound = false;
                frame
            }
            Ok(None) if !just_rewound => {
                just_rewound = true;
                if let Err(err) = source.rewind() {
                    let error = PipelineError::transient(Stage::Acquire, &err);
                    ctx.observer.on_error(&spec.id, &error);
                    status.record_error(error);
                    pacer.pace(started.elapsed());
                    just_rewound = false;
                }
                continue;
            }
            Ok(None) => {
                let error = PipelineError::transient(
                    Stage::Acquire,
                    &anyhow!("source yielded no frames after rewind"),
                );
                ctx.observer.on_error(&spec.id, &error);
                status.record_error(error);
                just_rewound = false;
                pacer.pace(started.elapsed());
                continue;
            }
            Err(err) => {
                let error = PipelineError::transient(Stage::Acquire, &err);
                ctx.observer.on_error(&spec.id, &error);
                status.record_error(error);
                pacer.pace(started.elapsed());
                continue;
            }
        };

        let fps = meter.tick(Instant::now());
        sequence += 1;
        let meta = SnapshotMeta { fps, sequence };
        match pipeline.run_cycle(&frame, meta) {
            Ok((snapshot, motion)) => {
                let keys = snapshot.images.keys().copied().collect();
                ctx.buffers.publish(&spec.id, snapshot);
                status.record_published(fps);
                ctx.observer.on_cycle(
                    &spec.id,
                    &CycleReport {
                        sequence,
                        fps,
                        keys,
                        motion,
                        elapsed: started.elapsed(),
                    },
                );
            }
            Err(error) => {
                ctx.observer.on_error(&spec.id, &error);
                status.record_error(error);
            }
        }
        drop(frame);

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let report = status.report();
            log::info!(
                "producer {} health: fps={:.1} published={} skipped={}",
                spec.id,
                report.fps,
                report.published,
                report.skipped
            );
            last_health_log = Instant::now();
        }

        pacer.pace(started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_never_sleeps_past_an_overrun() {
        let pacer = Pacer::from_fps(25.0);
        assert_eq!(pacer.interval(), Duration::from_millis(40));
        assert_eq!(pacer.delay(Duration::from_millis(10)), Duration::from_millis(30));
        assert_eq!(pacer.delay(Duration::from_millis(40)), Duration::ZERO);
        assert_eq!(pacer.delay(Duration::from_millis(250)), Duration::ZERO);
        assert_eq!(Pacer::from_fps(0.0).interval(), Duration::ZERO);
    }

    #[test]
    fn fps_meter_reports_per_second_windows() {
        let start = Instant::now();
        let mut meter = FpsMeter::new(start);
        for i in 1..10 {
            assert_eq!(meter.tick(start + Duration::from_millis(i * 100)), 0.0);
        }
        assert_eq!(meter.tick(start + Duration::from_millis(1000)), 10.0);
        // Second window closes at 2 s with two frames; the value holds until the next close.
        meter.tick(start + Duration::from_millis(1500));
        meter.tick(start + Duration::from_millis(2000));
        assert_eq!(meter.tick(start + Duration::from_millis(2500)), 2.0);
        assert_eq!(meter.fps(), 2.0);
    }

    #[test]
    fn source_validation_rejects_incomplete_sources() {
        assert!(SourceSpec::new("", "stub://a").validate().is_err());
        assert!(SourceSpec::new("a", " ").validate().is_err());
        let mut spec = SourceSpec::new("a", "stub://a");
        spec.views.clear();
        assert!(spec.validate().is_err());
        spec.fisheye = false;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn plain_sources_publish_only_the_original() {
        let ctx = ProducerContext {
            encoder: FrameEncoder::new(32, 18, 50).unwrap(),
            ..ProducerContext::new(Arc::new(FrameBuffers::new()))
        };
        let mut spec = SourceSpec::new("door", "stub://door");
        spec.fisheye = false;
        let (mut pipeline, fallback) = SourcePipeline::new(&spec, &ctx, (64, 48)).unwrap();
        assert!(fallback.is_none());
        let frame = SourceFrame::new(image::RgbImage::new(64, 48), 0);
        let (snapshot, motion) = pipeline.run_cycle(&frame, SnapshotMeta::default()).unwrap();
        assert_eq!(
            snapshot.images.keys().copied().collect::<Vec<_>>(),
            vec![ViewKey::Original]
        );
        assert!(motion.is_empty());
    }

    #[test]
    fn status_counts_skipped_cycles() {
        let status = ProducerStatus::new();
        status.record_published(9.5);
        status.record_error(PipelineError::transient(Stage::Encode, &anyhow!("boom")));
        status.record_error(PipelineError::acceleration_unavailable("no adapter"));
        let report = status.report();
        assert_eq!(report.published, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.fps, 9.5);
        assert_eq!(report.last_error.unwrap().code(), "ACCELERATION_UNAVAILABLE");
    }
}
