//! Motion detection for rendered views.
//!
//! The compositor only depends on the `MotionDetector` trait. The built-in
//! `BackgroundSubtractor` keeps a running-average background per view; the
//! `StubDetector` replays a fixed script and exists for tests and demos.

mod backend;
mod backends;
mod result;

pub use backend::{DetectorFactory, MotionDetector};
pub use backends::{BackgroundSubtractor, StubDetector, SubtractorSettings};
pub use result::{Detection, MotionOutcome};

use std::sync::Arc;

/// Factory producing a default `BackgroundSubtractor` for every view.
pub fn background_subtractor_factory() -> DetectorFactory {
    Arc::new(|_view_index: usize| -> Box<dyn MotionDetector> {
        Box::new(BackgroundSubtractor::default())
    })
}
