//! View compositor.
//!
//! Owns every remap table of one source and turns each decoded frame into the
//! set of planar views, plus an optional annotated copy of the original frame.
//!
//! Per frame:
//!
//! 1. Recompute the centered square crop if the frame size changed.
//! 2. Remap the crop through each selected, enabled view's table.
//! 3. Rotate the view 180° (ceiling mount compensation, not configurable).
//! 4. Run motion detection when enabled, drawing an alert border on hits.
//! 5. Store the view under `partition_<i>`; disabled slots are skipped, never renumbered.
//! 6. Optionally outline each view's footprint on a copy of the original frame.
//! 7. Letterbox the (annotated) original frame under `original`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops;
use image::{GrayImage, RgbImage};

use crate::detect::{DetectorFactory, MotionDetector};
use crate::error::PipelineError;
use crate::frame::{CropGeometry, SourceFrame};
use crate::overlay::{draw_alert_border, draw_polyline, pad_to_size, FOOTPRINT_COLOR};
use crate::projection::{build_remap_table, view_footprint, ProjectionParams, RemapTable};
use crate::transform::TransformBackend;
use crate::view::{ViewConfig, ViewKey, ViewSelector};

/// Internal remap target (width, height); independent of the streaming size.
pub const DEFAULT_REMAP_SIZE: (u32, u32) = (2560, 1920);
/// Letterboxed size of the original frame (width, height).
pub const DEFAULT_ORIGINAL_SIZE: (u32, u32) = (640, 360);
/// Full field of view of the fisheye lens.
pub const DEFAULT_INPUT_FOV_DEG: f64 = 180.0;

const FOOTPRINT_THICKNESS: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompositorOptions {
    pub input_fov_deg: f64,
    /// (width, height) of every remapped view.
    pub remap_size: (u32, u32),
    pub show_original: bool,
    /// (width, height) of the letterboxed original frame.
    pub original_size: (u32, u32),
}

impl Default for CompositorOptions {
    fn default() -> Self {
        Self {
            input_fov_deg: DEFAULT_INPUT_FOV_DEG,
            remap_size: DEFAULT_REMAP_SIZE,
            show_original: true,
            original_size: DEFAULT_ORIGINAL_SIZE,
        }
    }
}

/// Images, motion masks and motion flags of one render pass, keyed identically.
///
/// Masks and flags only exist for views where detection ran.
#[derive(Debug, Default)]
pub struct RenderOutput {
    pub images: BTreeMap<ViewKey, RgbImage>,
    pub masks: BTreeMap<ViewKey, GrayImage>,
    pub motion: BTreeMap<ViewKey, bool>,
}

pub struct ViewCompositor {
    views: Vec<ViewConfig>,
    tables: Vec<Option<Arc<RemapTable>>>,
    footprints: Vec<Option<[(f64, f64); 4]>>,
    crop: CropGeometry,
    options: CompositorOptions,
    backend: Box<dyn TransformBackend>,
    detectors: Vec<Option<Box<dyn MotionDetector>>>,
    configuration_errors: Vec<PipelineError>,
}

impl ViewCompositor {
    /// Builds every remap table for a source of `frame_dims` (width, height).
    ///
    /// A view whose table cannot be built becomes a disabled slot. Motion
    /// detection runs for every enabled view when `detectors` is provided.
    pub fn new(
        frame_dims: (u32, u32),
        views: Vec<ViewConfig>,
        options: CompositorOptions,
        backend: Box<dyn TransformBackend>,
        detectors: Option<DetectorFactory>,
    ) -> Result<Self> {
        if views.is_empty() {
            return Err(anyhow!("view configuration list cannot be empty"));
        }
        if options.remap_size.0 == 0 || options.remap_size.1 == 0 {
            return Err(anyhow!("remap size must be non-empty"));
        }
        if frame_dims.0 == 0 || frame_dims.1 == 0 {
            return Err(anyhow!("source frame must be non-empty"));
        }

        let mut compositor = Self {
            views,
            tables: Vec::new(),
            footprints: Vec::new(),
            crop: CropGeometry::for_dimensions(frame_dims.0, frame_dims.1),
            options,
            backend,
            detectors: Vec::new(),
            configuration_errors: Vec::new(),
        };
        compositor.build_tables()?;

        if let Some(factory) = detectors {
            compositor.detectors = compositor
                .tables
                .iter()
                .enumerate()
                .map(|(i, table)| table.as_ref().map(|_| factory(i)))
                .collect();
            log::info!(
                "compositor: motion detection on {} views",
                compositor.detectors.iter().flatten().count()
            );
        }
        Ok(compositor)
    }

    fn params_for(&self, view: &ViewConfig) -> Option<ProjectionParams> {
        let (w, h) = self.options.remap_size;
        ProjectionParams::for_view(
            view,
            self.crop.shape(),
            (h as usize, w as usize),
            self.options.input_fov_deg,
        )
    }

    fn build_tables(&mut self) -> Result<()> {
        let mut tables = Vec::with_capacity(self.views.len());
        let mut footprints = Vec::with_capacity(self.views.len());
        let mut errors = Vec::new();

        for (i, view) in self.views.iter().enumerate() {
            let built = view.validate().and_then(|_| match self.params_for(view) {
                Some(params) => {
                    let table = build_remap_table(&params)?;
                    let footprint = view_footprint(&params)?;
                    Ok(Some((table, footprint)))
                }
                None => Ok(None),
            });
            match built {
                Ok(Some((table, footprint))) => {
                    tables.push(Some(Arc::new(table)));
                    footprints.push(Some(footprint));
                }
                Ok(None) => {
                    tables.push(None);
                    footprints.push(None);
                }
                Err(err) => {
                    let err = PipelineError::configuration(i, format!("{:#}", err));
                    log::warn!("compositor: {}; view disabled", err);
                    errors.push(err);
                    tables.push(None);
                    footprints.push(None);
                }
            }
        }

        self.backend
            .prepare(&tables)
            .with_context(|| format!("{} backend rejected remap tables", self.backend.name()))?;
        self.tables = tables;
        self.footprints = footprints;
        self.configuration_errors = errors;
        log::info!(
            "compositor: {} of {} remap tables built for {}x{} crop ({} backend)",
            self.tables.iter().flatten().count(),
            self.tables.len(),
            self.crop.side,
            self.crop.side,
            self.backend.name()
        );
        Ok(())
    }

    /// Adapts to a new source frame size. Tables are only rebuilt when the crop side changes.
    fn reconfigure(&mut self, width: u32, height: u32) -> Result<()> {
        let next = CropGeometry::for_dimensions(width, height);
        if next.side == 0 {
            return Err(anyhow!("source frame is empty"));
        }
        let rebuild = next.side != self.crop.side;
        log::info!(
            "compositor: source size changed {}x{} -> {}x{} (crop offset {},{})",
            self.crop.source.0,
            self.crop.source.1,
            width,
            height,
            next.offset_x,
            next.offset_y
        );
        let previous = std::mem::replace(&mut self.crop, next);
        if rebuild {
            if let Err(err) = self.build_tables() {
                self.crop = previous;
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn render(
        &mut self,
        frame: &SourceFrame,
        include_overlay: bool,
        selector: ViewSelector,
    ) -> Result<RenderOutput> {
        let (width, height) = frame.dimensions();
        if !self.crop.matches(width, height) {
            self.reconfigure(width, height)?;
        }

        let mut output = RenderOutput::default();
        let selected: Vec<usize> = (0..self.tables.len())
            .filter(|&i| self.tables[i].is_some() && selector.includes_partition(i))
            .collect();

        if !selected.is_empty() {
            let cropped = self.crop.crop(frame.image())?;
            self.backend.begin_frame(&cropped)?;
            for i in selected {
                let Some(table) = self.tables[i].clone() else {
                    continue;
                };
                let key = ViewKey::Partition(i);
                let mut planar = self
                    .backend
                    .remap(&cropped, i, &table)
                    .with_context(|| format!("remap {}", key))?;
                imageops::rotate180_in_place(&mut planar);

                if let Some(Some(detector)) = self.detectors.get_mut(i) {
                    let outcome = detector
                        .detect(&planar, self.views[i].zones())
                        .with_context(|| format!("motion detection on {}", key))?;
                    let motion = outcome.motion_detected();
                    if motion {
                        draw_alert_border(&mut planar);
                    }
                    output.motion.insert(key, motion);
                    if let Some(mask) = outcome.mask {
                        output.masks.insert(key, mask);
                    }
                }
                output.images.insert(key, planar);
            }
        }

        if self.options.show_original && selector.includes_original() {
            let (ow, oh) = self.options.original_size;
            let original = if include_overlay {
                let mut annotated = frame.image().clone();
                self.draw_footprints(&mut annotated);
                pad_to_size(&annotated, ow, oh)
            } else {
                pad_to_size(frame.image(), ow, oh)
            };
            output.images.insert(ViewKey::Original, original);
        }

        Ok(output)
    }

    /// Outlines every enabled view's coverage on the uncropped frame.
    fn draw_footprints(&self, image: &mut RgbImage) {
        let (dx, dy) = (self.crop.offset_x as f64, self.crop.offset_y as f64);
        for footprint in self.footprints.iter().flatten() {
            let points: Vec<(i64, i64)> = footprint
                .iter()
                .map(|(x, y)| ((x + dx) as i64, (y + dy) as i64))
                .collect();
            draw_polyline(image, &points, true, FOOTPRINT_COLOR, FOOTPRINT_THICKNESS);
        }
    }

    pub fn views(&self) -> &[ViewConfig] {
        &self.views
    }

    pub fn tables(&self) -> &[Option<Arc<RemapTable>>] {
        &self.tables
    }

    pub fn crop(&self) -> CropGeometry {
        self.crop
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Views that were disabled because their table could not be built.
    pub fn configuration_errors(&self) -> &[PipelineError] {
        &self.configuration_errors
    }
}
