use anyhow::Result;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};

use crate::detect::backend::MotionDetector;
use crate::detect::result::{Detection, MotionOutcome};
use crate::view::ZonePolygon;

/// Tuning for `BackgroundSubtractor`.
#[derive(Clone, Copy, Debug)]
pub struct SubtractorSettings {
    /// Width the view is reduced to before analysis (height follows the aspect ratio).
    pub analysis_width: u32,
    /// Weight of the current frame when updating the background model.
    pub learning_rate: f32,
    /// Absolute luminance difference that marks a pixel as foreground.
    pub diff_threshold: f32,
    /// Minimum changed-pixel count of a region, measured at full view resolution.
    pub min_region_area: u32,
}

impl Default for SubtractorSettings {
    fn default() -> Self {
        Self {
            analysis_width: 320,
            learning_rate: 0.05,
            diff_threshold: 25.0,
            min_region_area: 50,
        }
    }
}

/// Running-average background subtraction.
///
/// The first frame (and any frame whose size differs from the model) only
/// seeds the background and never reports motion.
pub struct BackgroundSubtractor {
    settings: SubtractorSettings,
    background: Option<Background>,
}

struct Background {
    width: u32,
    height: u32,
    model: Vec<f32>,
}

impl Default for BackgroundSubtractor {
    fn default() -> Self {
        Self::new(SubtractorSettings::default())
    }
}

impl BackgroundSubtractor {
    pub fn new(settings: SubtractorSettings) -> Self {
        Self {
            settings,
            background: None,
        }
    }

    fn analysis_frame(&self, image: &RgbImage) -> GrayImage {
        let gray = imageops::grayscale(image);
        let target_w = self.settings.analysis_width.max(1);
        if gray.width() <= target_w {
            return gray;
        }
        let target_h = ((gray.height() as u64 * target_w as u64) / gray.width() as u64).max(1) as u32;
        imageops::resize(&gray, target_w, target_h, FilterType::Triangle)
    }
}

impl MotionDetector for BackgroundSubtractor {
    fn name(&self) -> &'static str {
        "background"
    }

    fn detect(&mut self, image: &RgbImage, zones: &[ZonePolygon]) -> Result<MotionOutcome> {
        let frame = self.analysis_frame(image);
        let (width, height) = frame.dimensions();
        let current: Vec<f32> = frame.as_raw().iter().map(|&v| v as f32).collect();

        let background = match self.background.as_mut() {
            Some(bg) if bg.width == width && bg.height == height => bg,
            _ => {
                self.background = Some(Background {
                    width,
                    height,
                    model: current,
                });
                return Ok(MotionOutcome {
                    detections: None,
                    mask: Some(GrayImage::new(width, height)),
                });
            }
        };

        let mut mask = GrayImage::new(width, height);
        for (i, (bg, &cur)) in background.model.iter_mut().zip(&current).enumerate() {
            let x = (i as u32) % width;
            let y = (i as u32) / width;
            if (cur - *bg).abs() > self.settings.diff_threshold && in_zones(zones, x, y, width, height)
            {
                mask.put_pixel(x, y, Luma([255]));
            }
            *bg += (cur - *bg) * self.settings.learning_rate;
        }

        // Region areas are compared at full view resolution.
        let scale_x = image.width() as f32 / width as f32;
        let scale_y = image.height() as f32 / height as f32;
        let min_area = (self.settings.min_region_area as f32 / (scale_x * scale_y)).max(1.0) as u32;

        let detections: Vec<Detection> = connected_regions(&mask)
            .into_iter()
            .filter(|region| region.area >= min_area)
            .map(|region| Detection {
                x: (region.x as f32 * scale_x) as u32,
                y: (region.y as f32 * scale_y) as u32,
                w: ((region.w as f32 * scale_x).ceil() as u32).max(1),
                h: ((region.h as f32 * scale_y).ceil() as u32).max(1),
                area: ((region.area as f32) * scale_x * scale_y) as u32,
            })
            .collect();

        Ok(MotionOutcome {
            detections: if detections.is_empty() {
                None
            } else {
                Some(detections)
            },
            mask: Some(mask),
        })
    }
}

fn in_zones(zones: &[ZonePolygon], x: u32, y: u32, width: u32, height: u32) -> bool {
    if zones.is_empty() {
        return true;
    }
    let nx = (x as f32 + 0.5) / width as f32;
    let ny = (y as f32 + 0.5) / height as f32;
    zones.iter().any(|zone| zone.contains(nx, ny))
}

/// 4-connected foreground regions of a binary mask.
fn connected_regions(mask: &GrayImage) -> Vec<Detection> {
    let (width, height) = mask.dimensions();
    let mut visited = vec![false; (width * height) as usize];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..(width * height) {
        if visited[start as usize] || mask.as_raw()[start as usize] == 0 {
            continue;
        }
        visited[start as usize] = true;
        stack.push(start);
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
        let mut area = 0u32;
        while let Some(idx) = stack.pop() {
            let x = idx % width;
            let y = idx / width;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            let mut push = |nx: u32, ny: u32| {
                let n = ny * width + nx;
                if !visited[n as usize] && mask.as_raw()[n as usize] != 0 {
                    visited[n as usize] = true;
                    stack.push(n);
                }
            };
            if x > 0 {
                push(x - 1, y);
            }
            if x + 1 < width {
                push(x + 1, y);
            }
            if y > 0 {
                push(x, y - 1);
            }
            if y + 1 < height {
                push(x, y + 1);
            }
        }
        regions.push(Detection {
            x: min_x,
            y: min_y,
            w: max_x - min_x + 1,
            h: max_y - min_y + 1,
            area,
        });
    }
    regions
}
