use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

use crate::detect::result::MotionOutcome;
use crate::view::ZonePolygon;

/// Motion detector collaborator.
///
/// One instance is owned per view by the producing thread, so implementations
/// may keep a background model across calls without synchronisation.
///
/// Detection is advisory: implementations read the image and never modify it.
pub trait MotionDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Analyse one rendered view. Empty `zones` means the whole view is watched.
    fn detect(&mut self, image: &RgbImage, zones: &[ZonePolygon]) -> Result<MotionOutcome>;
}

/// Builds one detector per enabled view index.
pub type DetectorFactory = Arc<dyn Fn(usize) -> Box<dyn MotionDetector> + Send + Sync>;
