//! JPEG encoding of rendered views for streaming.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};

pub const DEFAULT_STREAM_SIZE: (u32, u32) = (640, 360);
pub const DEFAULT_JPEG_QUALITY: u8 = 40;

/// Immutable encoded image. Cloning shares the bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedImage(Arc<[u8]>);

impl EncodedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for EncodedImage {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

/// Resizes to the stream size and encodes as baseline JPEG.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameEncoder {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            width: DEFAULT_STREAM_SIZE.0,
            height: DEFAULT_STREAM_SIZE.1,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl FrameEncoder {
    pub fn new(width: u32, height: u32, quality: u8) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("stream size must be non-empty"));
        }
        if !(1..=100).contains(&quality) {
            return Err(anyhow!("jpeg quality must be in 1..=100, got {}", quality));
        }
        Ok(Self {
            width,
            height,
            quality,
        })
    }

    pub fn encode(&self, image: &RgbImage) -> Result<EncodedImage> {
        let resized;
        let source = if image.dimensions() == (self.width, self.height) {
            image
        } else {
            resized = imageops::resize(image, self.width, self.height, FilterType::Triangle);
            &resized
        };

        let mut bytes = Vec::with_capacity((self.width * self.height / 8) as usize);
        JpegEncoder::new_with_quality(&mut bytes, self.quality)
            .encode(
                source.as_raw(),
                source.width(),
                source.height(),
                ExtendedColorType::Rgb8,
            )
            .context("jpeg encode")?;
        Ok(EncodedImage::from(bytes))
    }
}
