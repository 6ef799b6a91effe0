use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

use crate::projection::RemapTable;

/// Image-transform backend trait.
///
/// A backend is chosen once when a compositor is built and is then driven for
/// every frame in the same order:
///
/// 1. `prepare` once with every view's table (disabled slots are `None`).
/// 2. `begin_frame` once per frame with the cropped fisheye image.
/// 3. `remap` once per rendered view.
///
/// Implementations must produce the same pixels for the same inputs on every call.
pub trait TransformBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Make the remap tables resident wherever the backend samples from.
    fn prepare(&mut self, _tables: &[Option<Arc<RemapTable>>]) -> Result<()> {
        Ok(())
    }

    /// Stage the cropped frame for the remaps that follow.
    fn begin_frame(&mut self, _crop: &RgbImage) -> Result<()> {
        Ok(())
    }

    /// Resample `crop` through the table of view `view_index`.
    ///
    /// Bilinear interpolation, samples outside the crop read as black.
    fn remap(&mut self, crop: &RgbImage, view_index: usize, table: &RemapTable)
        -> Result<RgbImage>;
}
