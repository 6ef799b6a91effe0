use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use fisheye_views::buffer::{FrameBuffers, Snapshot, SnapshotMeta};
use fisheye_views::compositor::CompositorOptions;
use fisheye_views::detect::{DetectorFactory, MotionDetector, MotionOutcome};
use fisheye_views::encode::{EncodedImage, FrameEncoder};
use fisheye_views::ingest::{open_source, FrameSource, SourceFactory};
use fisheye_views::producer::{CycleObserver, CycleReport, ProducerContext, StartOutcome};
use fisheye_views::view::ZonePolygon;
use fisheye_views::{PipelineError, ProducerRegistry, SourceFrame, SourceSpec, ViewConfig, ViewKey};

#[derive(Default)]
struct RecordingObserver {
    cycles: AtomicUsize,
    errors: Mutex<Vec<PipelineError>>,
}

impl CycleObserver for RecordingObserver {
    fn on_cycle(&self, _source_id: &str, _report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _source_id: &str, error: &PipelineError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

/// Wraps a source and records the index of every frame it yields.
struct IndexRecorder {
    inner: Box<dyn FrameSource>,
    seen: Arc<Mutex<Vec<u64>>>,
}

impl FrameSource for IndexRecorder {
    fn open(&mut self) -> Result<()> {
        self.inner.open()
    }

    fn read_frame(&mut self) -> Result<Option<SourceFrame>> {
        let frame = self.inner.read_frame()?;
        if let Some(frame) = &frame {
            self.seen.lock().unwrap().push(frame.index);
        }
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<()> {
        self.inner.rewind()
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.inner.nominal_fps()
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.inner.dimensions()
    }
}

/// Detector that fails on calls `failing.start..failing.end` (zero-based).
struct FlakyDetector {
    calls: Arc<AtomicUsize>,
    failing: std::ops::Range<usize>,
}

impl MotionDetector for FlakyDetector {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn detect(&mut self, _image: &RgbImage, _zones: &[ZonePolygon]) -> Result<MotionOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&call) {
            return Err(anyhow!("detector call {} failed", call));
        }
        Ok(MotionOutcome::default())
    }
}

/// Records published sequences and, for every error, the sequence still visible in the buffer.
struct SequenceObserver {
    buffers: Arc<FrameBuffers>,
    published: Mutex<Vec<u64>>,
    errors: Mutex<Vec<(String, Option<u64>)>>,
}

impl CycleObserver for SequenceObserver {
    fn on_cycle(&self, _source_id: &str, report: &CycleReport) {
        self.published.lock().unwrap().push(report.sequence);
    }

    fn on_error(&self, source_id: &str, error: &PipelineError) {
        let visible = self.buffers.latest(source_id).map(|s| s.meta.sequence);
        self.errors
            .lock()
            .unwrap()
            .push((error.code().to_string(), visible));
    }
}

fn small_context(buffers: Arc<FrameBuffers>, observer: Arc<RecordingObserver>) -> ProducerContext {
    ProducerContext {
        encoder: FrameEncoder::new(32, 18, 60).unwrap(),
        compositor: CompositorOptions {
            remap_size: (32, 24),
            original_size: (32, 18),
            ..CompositorOptions::default()
        },
        observer,
        ..ProducerContext::new(buffers)
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn finite_source_loops_without_gaps() {
    let buffers = Arc::new(FrameBuffers::new());
    let observer = Arc::new(RecordingObserver::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory_seen = Arc::clone(&seen);
    let factory: SourceFactory = Arc::new(move |path: &str| -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(IndexRecorder {
            inner: open_source(path)?,
            seen: Arc::clone(&factory_seen),
        }))
    });

    let spec = SourceSpec {
        fisheye: false,
        ..SourceSpec::new("loop", "stub://loop?frames=10&width=32&height=24&fps=500")
    };
    let registry = ProducerRegistry::new();
    let outcome = registry
        .start(spec, small_context(Arc::clone(&buffers), Arc::clone(&observer)), factory)
        .unwrap();
    assert_eq!(outcome, StartOutcome::Started);

    assert!(wait_until(Duration::from_secs(10), || seen.lock().unwrap().len() >= 25));
    let indices = seen.lock().unwrap().clone();
    for (position, index) in indices.iter().enumerate() {
        assert_eq!(*index, (position % 10) as u64, "frames: {:?}", indices);
    }
    assert!(observer.errors.lock().unwrap().is_empty());

    let snapshot = buffers.latest("loop").unwrap();
    assert_eq!(
        snapshot.images.keys().copied().collect::<Vec<_>>(),
        vec![ViewKey::Original]
    );
}

#[test]
fn fisheye_source_publishes_enabled_views() {
    let buffers = Arc::new(FrameBuffers::new());
    let observer = Arc::new(RecordingObserver::default());
    let spec = SourceSpec {
        views: vec![
            ViewConfig::active(0.0, 35.0, 80.0),
            ViewConfig::Disabled,
            ViewConfig::active(180.0, 35.0, 80.0),
        ],
        overlay: true,
        ..SourceSpec::new("ceiling", "stub://ceiling?frames=5&width=64&height=48&fps=200")
    };
    let registry = ProducerRegistry::new();
    registry
        .start(
            spec,
            small_context(Arc::clone(&buffers), Arc::clone(&observer)),
            Arc::new(open_source),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || buffers.latest("ceiling").is_some()));
    let snapshot = buffers.latest("ceiling").unwrap();
    let keys: Vec<String> = snapshot.images.keys().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["original", "partition_0", "partition_2"]);
    for image in snapshot.images.values() {
        let decoded = image::load_from_memory(image.bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 18));
    }
    let status = registry.status("ceiling").unwrap();
    assert_eq!(status.backend, Some("cpu"));
    assert!(wait_until(Duration::from_secs(5), || {
        observer.cycles.load(Ordering::SeqCst) >= 1
    }));
}

#[test]
fn failed_cycles_are_skipped_and_last_snapshot_stays_visible() {
    let buffers = Arc::new(FrameBuffers::new());
    let observer = Arc::new(SequenceObserver {
        buffers: Arc::clone(&buffers),
        published: Mutex::new(Vec::new()),
        errors: Mutex::new(Vec::new()),
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let factory_calls = Arc::clone(&calls);
    let detectors: DetectorFactory = Arc::new(move |_view: usize| -> Box<dyn MotionDetector> {
        Box::new(FlakyDetector {
            calls: Arc::clone(&factory_calls),
            failing: 2..6,
        })
    });
    let mut ctx = small_context(Arc::clone(&buffers), Arc::new(RecordingObserver::default()));
    ctx.detectors = detectors;
    ctx.observer = Arc::clone(&observer) as Arc<dyn CycleObserver>;
    let spec = SourceSpec {
        motion_detection: true,
        ..SourceSpec::new("flaky", "stub://flaky?frames=5&width=48&height=48&fps=200")
    };
    let registry = ProducerRegistry::new();
    registry.start(spec, ctx, Arc::new(open_source)).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        observer.published.lock().unwrap().len() >= 8
    }));
    let published = observer.published.lock().unwrap().clone();
    assert_eq!(&published[..4], &[1, 2, 7, 8], "published: {:?}", published);

    let errors = observer.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 4, "errors: {:?}", errors);
    for (code, visible) in &errors {
        assert_eq!(code, "TRANSIENT_PROCESSING_ERROR");
        assert_eq!(*visible, Some(2));
    }
    assert!(registry.is_running("flaky"));
    assert!(buffers.latest("flaky").unwrap().meta.sequence >= 8);
}

#[test]
fn concurrent_starts_spawn_one_producer() {
    let buffers = Arc::new(FrameBuffers::new());
    let observer = Arc::new(RecordingObserver::default());
    let opened = Arc::new(AtomicUsize::new(0));
    let factory_opened = Arc::clone(&opened);
    let factory: SourceFactory = Arc::new(move |path: &str| -> Result<Box<dyn FrameSource>> {
        factory_opened.fetch_add(1, Ordering::SeqCst);
        open_source(path)
    });

    let registry = ProducerRegistry::new();
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            let ctx = small_context(Arc::clone(&buffers), Arc::clone(&observer));
            let factory = Arc::clone(&factory);
            std::thread::spawn(move || {
                let spec = SourceSpec {
                    fisheye: false,
                    ..SourceSpec::new("shared", "stub://shared?width=16&height=16&fps=50")
                };
                barrier.wait();
                registry.start(spec, ctx, factory).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<StartOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(
        outcomes.iter().filter(|o| **o == StartOutcome::Started).count(),
        1
    );
    assert!(wait_until(Duration::from_secs(5), || buffers.latest("shared").is_some()));
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(registry.active_sources(), vec!["shared".to_string()]);
}

#[test]
fn unavailable_source_deregisters_without_publishing() {
    let buffers = Arc::new(FrameBuffers::new());
    let observer = Arc::new(RecordingObserver::default());
    let registry = ProducerRegistry::new();
    let spec = SourceSpec::new("remote", "rtsp://camera.invalid/stream");
    registry
        .start(
            spec.clone(),
            small_context(Arc::clone(&buffers), Arc::clone(&observer)),
            Arc::new(open_source),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !registry.is_running("remote")));
    assert!(buffers.latest("remote").is_none());
    let errors = observer.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code(), "SOURCE_UNAVAILABLE");

    // A stopped source can be started again.
    let outcome = registry
        .start(
            spec,
            small_context(Arc::clone(&buffers), Arc::clone(&observer)),
            Arc::new(open_source),
        )
        .unwrap();
    assert_eq!(outcome, StartOutcome::Started);
}

#[test]
fn invalid_view_is_reported_and_others_still_publish() {
    let buffers = Arc::new(FrameBuffers::new());
    let observer = Arc::new(RecordingObserver::default());
    let spec = SourceSpec {
        views: vec![ViewConfig::active(0.0, 0.0, 0.0), ViewConfig::default()],
        show_original: false,
        ..SourceSpec::new("partial", "stub://partial?frames=3&width=48&height=48&fps=100")
    };
    ProducerRegistry::new()
        .start(
            spec,
            small_context(Arc::clone(&buffers), Arc::clone(&observer)),
            Arc::new(open_source),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || buffers.latest("partial").is_some()));
    let snapshot = buffers.latest("partial").unwrap();
    assert_eq!(
        snapshot.images.keys().copied().collect::<Vec<_>>(),
        vec![ViewKey::Partition(1)]
    );
    let errors = observer.errors.lock().unwrap().clone();
    assert!(errors
        .iter()
        .any(|e| matches!(e, PipelineError::Configuration { view_index: 0, .. })));
}

#[test]
fn readers_never_observe_mixed_snapshots() {
    let buffers = Arc::new(FrameBuffers::new());
    let even_keys = [ViewKey::Original, ViewKey::Partition(0), ViewKey::Partition(2)];
    let odd_keys = [ViewKey::Partition(1), ViewKey::Partition(3)];

    let writer_buffers = Arc::clone(&buffers);
    let writer = std::thread::spawn(move || {
        for sequence in 1..=2_000u64 {
            let keys: &[ViewKey] = if sequence % 2 == 0 { &even_keys } else { &odd_keys };
            let images = keys
                .iter()
                .map(|k| (*k, EncodedImage::from(sequence.to_le_bytes().to_vec())))
                .collect();
            writer_buffers.publish(
                "cam",
                Snapshot {
                    images,
                    meta: SnapshotMeta {
                        fps: sequence as f32,
                        sequence,
                    },
                },
            );
        }
    });

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let buffers = Arc::clone(&buffers);
            std::thread::spawn(move || {
                let mut observed = 0;
                for _ in 0..5_000 {
                    let Some(snapshot) = buffers.latest("cam") else {
                        continue;
                    };
                    let sequence = snapshot.meta.sequence;
                    let expected: BTreeSet<ViewKey> = if sequence % 2 == 0 {
                        even_keys.iter().copied().collect()
                    } else {
                        odd_keys.iter().copied().collect()
                    };
                    let keys: BTreeSet<ViewKey> = snapshot.images.keys().copied().collect();
                    assert_eq!(keys, expected);
                    for image in snapshot.images.values() {
                        assert_eq!(image.bytes(), sequence.to_le_bytes().as_slice());
                    }
                    assert_eq!(snapshot.meta.fps, sequence as f32);
                    observed += 1;
                }
                observed
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(buffers.latest("cam").unwrap().meta.sequence, 2_000);
}
