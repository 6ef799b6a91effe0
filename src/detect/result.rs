use image::GrayImage;

/// Axis-aligned region of detected motion, in pixels of the analysed image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Detection {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Number of changed pixels inside the region.
    pub area: u32,
}

/// Result of one motion-detector call.
///
/// `detections` is `None` when nothing qualified (or the model is still warming up);
/// it is never `Some` of an empty list.
#[derive(Clone, Debug, Default)]
pub struct MotionOutcome {
    pub detections: Option<Vec<Detection>>,
    pub mask: Option<GrayImage>,
}

impl MotionOutcome {
    pub fn motion_detected(&self) -> bool {
        self.detections.is_some()
    }
}
