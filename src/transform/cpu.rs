use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::projection::RemapTable;
use crate::transform::backend::TransformBackend;

/// CPU backend: scalar bilinear remap.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl TransformBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn remap(
        &mut self,
        crop: &RgbImage,
        _view_index: usize,
        table: &RemapTable,
    ) -> Result<RgbImage> {
        remap_bilinear(crop, table)
    }
}

/// Resamples `src` through `table` with bilinear interpolation and a constant black border.
pub fn remap_bilinear(src: &RgbImage, table: &RemapTable) -> Result<RgbImage> {
    let expected = table.width * table.height;
    if table.map_x.len() != expected || table.map_y.len() != expected {
        return Err(anyhow!(
            "remap table is {}x{} but holds {}/{} entries",
            table.width,
            table.height,
            table.map_x.len(),
            table.map_y.len()
        ));
    }

    let width = u32::try_from(table.width).map_err(|_| anyhow!("remap width overflows"))?;
    let height = u32::try_from(table.height).map_err(|_| anyhow!("remap height overflows"))?;
    let mut out = RgbImage::new(width, height);
    let sampler = Sampler::new(src);
    for ((dst, &x), &y) in out
        .as_mut()
        .chunks_exact_mut(3)
        .zip(&table.map_x)
        .zip(&table.map_y)
    {
        dst.copy_from_slice(&sampler.sample(x, y));
    }
    Ok(out)
}

struct Sampler<'a> {
    raw: &'a [u8],
    width: i64,
    height: i64,
}

impl<'a> Sampler<'a> {
    fn new(src: &'a RgbImage) -> Self {
        Self {
            raw: src.as_raw(),
            width: src.width() as i64,
            height: src.height() as i64,
        }
    }

    #[inline]
    fn fetch(&self, x: i64, y: i64) -> [f32; 3] {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return [0.0; 3];
        }
        let idx = ((y * self.width + x) * 3) as usize;
        [
            self.raw[idx] as f32,
            self.raw[idx + 1] as f32,
            self.raw[idx + 2] as f32,
        ]
    }

    #[inline]
    fn sample(&self, x: f32, y: f32) -> [u8; 3] {
        if !x.is_finite() || !y.is_finite() {
            return [0; 3];
        }
        let x0 = x.floor();
        let y0 = y.floor();
        // Whole neighbourhood outside the image: pure border.
        if x0 < -1.0 || y0 < -1.0 || x0 >= self.width as f32 || y0 >= self.height as f32 {
            return [0; 3];
        }
        let fx = x - x0;
        let fy = y - y0;
        let (xi, yi) = (x0 as i64, y0 as i64);

        let p00 = self.fetch(xi, yi);
        let p10 = self.fetch(xi + 1, yi);
        let p01 = self.fetch(xi, yi + 1);
        let p11 = self.fetch(xi + 1, yi + 1);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let top = p00[c] + (p10[c] - p00[c]) * fx;
            let bottom = p01[c] + (p11[c] - p01[c]) * fx;
            let value = top + (bottom - top) * fy;
            out[c] = value.round().clamp(0.0, 255.0) as u8;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn table(width: usize, height: usize, coords: &[(f32, f32)]) -> RemapTable {
        RemapTable {
            width,
            height,
            map_x: coords.iter().map(|c| c.0).collect(),
            map_y: coords.iter().map(|c| c.1).collect(),
        }
    }

    #[test]
    fn integer_coordinates_copy_pixels() {
        let mut src = RgbImage::new(2, 2);
        src.put_pixel(1, 0, Rgb([10, 20, 30]));
        src.put_pixel(0, 1, Rgb([40, 50, 60]));
        let t = table(2, 1, &[(1.0, 0.0), (0.0, 1.0)]);
        let out = remap_bilinear(&src, &t).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([40, 50, 60]));
    }

    #[test]
    fn midpoints_are_interpolated() {
        let mut src = RgbImage::new(2, 1);
        src.put_pixel(0, 0, Rgb([0, 0, 0]));
        src.put_pixel(1, 0, Rgb([100, 200, 50]));
        let out = remap_bilinear(&src, &table(1, 1, &[(0.5, 0.0)])).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgb([50, 100, 25]));
    }

    #[test]
    fn outside_samples_fade_to_black() {
        let src = RgbImage::from_pixel(2, 2, Rgb([200, 200, 200]));
        let t = table(3, 1, &[(-5.0, 0.0), (-0.5, 0.0), (f32::NAN, 0.0)]);
        let out = remap_bilinear(&src, &t).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([100, 100, 100]));
        assert_eq!(out.get_pixel(2, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn malformed_table_is_an_error() {
        let src = RgbImage::new(2, 2);
        let mut t = table(2, 1, &[(0.0, 0.0), (1.0, 1.0)]);
        t.map_y.pop();
        assert!(remap_bilinear(&src, &t).is_err());
    }
}
