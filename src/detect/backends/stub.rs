use anyhow::Result;
use image::{GrayImage, RgbImage};

use crate::detect::backend::MotionDetector;
use crate::detect::result::{Detection, MotionOutcome};
use crate::view::ZonePolygon;

/// Scripted detector: replays a fixed motion pattern, cycling when exhausted.
///
/// A `true` step reports one detection covering the whole view.
pub struct StubDetector {
    script: Vec<bool>,
    calls: usize,
}

impl StubDetector {
    pub fn new(script: Vec<bool>) -> Self {
        Self { script, calls: 0 }
    }

    /// Detector that reports motion on every call.
    pub fn always() -> Self {
        Self::new(vec![true])
    }

    /// Detector that never reports motion.
    pub fn never() -> Self {
        Self::new(vec![false])
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl MotionDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &RgbImage, _zones: &[ZonePolygon]) -> Result<MotionOutcome> {
        let motion = if self.script.is_empty() {
            false
        } else {
            self.script[self.calls % self.script.len()]
        };
        self.calls += 1;

        let (width, height) = image.dimensions();
        let detections = motion.then(|| {
            vec![Detection {
                x: 0,
                y: 0,
                w: width,
                h: height,
                area: width * height,
            }]
        });
        Ok(MotionOutcome {
            detections,
            mask: Some(GrayImage::new(width, height)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_detector_replays_script() {
        let mut detector = StubDetector::new(vec![false, true]);
        let image = RgbImage::new(4, 4);

        let r1 = detector.detect(&image, &[]).unwrap();
        assert!(!r1.motion_detected());

        let r2 = detector.detect(&image, &[]).unwrap();
        assert!(r2.motion_detected());
        assert_eq!(r2.detections.unwrap()[0].area, 16);

        let r3 = detector.detect(&image, &[]).unwrap();
        assert!(!r3.motion_detected());
        assert_eq!(detector.calls(), 3);
    }
}
