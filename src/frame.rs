//! Decoded frames and the centered square crop.
//!
//! - `SourceFrame`: one decoded RGB frame, owned by the producer for a single cycle.
//! - `CropGeometry`: centered square crop of side `min(width, height)`.
//!
//! Frames are never retained past the cycle that read them; the compositor
//! works on borrowed views and only the encoded outputs outlive the cycle.

use anyhow::{anyhow, Result};
use image::{GenericImageView, RgbImage, SubImage};

/// One decoded frame from a live source.
pub struct SourceFrame {
    image: RgbImage,
    /// Position of this frame within the source, starting at zero.
    pub index: u64,
}

impl SourceFrame {
    pub fn new(image: RgbImage, index: u64) -> Self {
        Self { image, index }
    }

    /// Build a frame from tightly packed RGB24 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", width, height))?;
        Ok(Self { image, index })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// Centered square crop of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropGeometry {
    /// Dimensions of the frame the crop was computed for.
    pub source: (u32, u32),
    pub offset_x: u32,
    pub offset_y: u32,
    pub side: u32,
}

impl CropGeometry {
    pub fn for_dimensions(width: u32, height: u32) -> Self {
        let side = width.min(height);
        Self {
            source: (width, height),
            offset_x: (width - side) / 2,
            offset_y: (height - side) / 2,
            side,
        }
    }

    /// Shape of the cropped image as (height, width).
    pub fn shape(&self) -> (usize, usize) {
        (self.side as usize, self.side as usize)
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.source == (width, height)
    }

    /// Borrowed crop of `image`. The image must have the dimensions this crop was computed for.
    pub fn view<'a>(&self, image: &'a RgbImage) -> Result<SubImage<&'a RgbImage>> {
        if !self.matches(image.width(), image.height()) {
            return Err(anyhow!(
                "crop computed for {}x{} applied to {}x{}",
                self.source.0,
                self.source.1,
                image.width(),
                image.height()
            ));
        }
        Ok(image.view(self.offset_x, self.offset_y, self.side, self.side))
    }

    /// Owned copy of the cropped region.
    pub fn crop(&self, image: &RgbImage) -> Result<RgbImage> {
        Ok(self.view(image)?.to_image())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn landscape_crop_is_centered_horizontally() {
        let crop = CropGeometry::for_dimensions(1920, 1080);
        assert_eq!(crop.side, 1080);
        assert_eq!(crop.offset_x, 420);
        assert_eq!(crop.offset_y, 0);
        assert_eq!(crop.shape(), (1080, 1080));
    }

    #[test]
    fn portrait_crop_is_centered_vertically() {
        let crop = CropGeometry::for_dimensions(480, 640);
        assert_eq!(crop.side, 480);
        assert_eq!((crop.offset_x, crop.offset_y), (0, 80));
    }

    #[test]
    fn crop_copies_the_center_square() {
        let mut image = RgbImage::new(6, 4);
        image.put_pixel(1, 0, Rgb([9, 9, 9]));
        image.put_pixel(4, 3, Rgb([7, 7, 7]));
        let crop = CropGeometry::for_dimensions(6, 4);
        let out = crop.crop(&image).unwrap();
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(3, 3), &Rgb([7, 7, 7]));
    }

    #[test]
    fn crop_refuses_mismatched_frames() {
        let crop = CropGeometry::for_dimensions(6, 4);
        assert!(crop.crop(&RgbImage::new(8, 4)).is_err());
    }

    #[test]
    fn from_rgb_validates_length() {
        assert!(SourceFrame::from_rgb(vec![0; 11], 2, 2, 0).is_err());
        let frame = SourceFrame::from_rgb(vec![0; 12], 2, 2, 5).unwrap();
        assert_eq!(frame.dimensions(), (2, 2));
        assert_eq!(frame.index, 5);
    }
}
