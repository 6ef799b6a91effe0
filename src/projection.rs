//! Fisheye → pinhole projection maps.
//!
//! Every destination pixel of a planar view is turned into a camera-space ray,
//! rotated by `R = Rz(roll) · Rx(pitch) · Ry(yaw)` (yaw applied first), converted
//! to spherical angles and mapped onto the fisheye image with the equidistant
//! model `r = φ · min(h, w) / fov`. The composition order and the negative sign
//! in the vertical source coordinate both fix the on-screen orientation of each
//! view and must not change.

use anyhow::{bail, Result};

use crate::view::ViewConfig;

pub type Mat3 = [[f64; 3]; 3];

/// Geometry of one projection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectionParams {
    /// (height, width) of the cropped fisheye image.
    pub fisheye_shape: (usize, usize),
    /// (height, width) of the planar output.
    pub output_shape: (usize, usize),
    /// Full lens field of view.
    pub input_fov_deg: f64,
    /// Vertical field of view of the planar output.
    pub output_fov_deg: f64,
    pub yaw_deg: f64,
    pub pitch_deg: f64,
    pub roll_deg: f64,
}

impl ProjectionParams {
    /// Parameters for a configured view: pan drives roll, tilt drives pitch, yaw stays zero.
    ///
    /// Returns `None` for disabled slots.
    pub fn for_view(
        view: &ViewConfig,
        fisheye_shape: (usize, usize),
        output_shape: (usize, usize),
        input_fov_deg: f64,
    ) -> Option<Self> {
        match view {
            ViewConfig::Active {
                pan_deg,
                tilt_deg,
                fov_deg,
                ..
            } => Some(Self {
                fisheye_shape,
                output_shape,
                input_fov_deg,
                output_fov_deg: *fov_deg,
                yaw_deg: 0.0,
                pitch_deg: *tilt_deg,
                roll_deg: *pan_deg,
            }),
            ViewConfig::Disabled => None,
        }
    }

    fn validate(&self) -> Result<()> {
        let (ih, iw) = self.fisheye_shape;
        let (oh, ow) = self.output_shape;
        if ih == 0 || iw == 0 {
            bail!("fisheye shape must be non-empty, got {}x{}", iw, ih);
        }
        if oh == 0 || ow == 0 {
            bail!("output shape must be non-empty, got {}x{}", ow, oh);
        }
        if !(self.input_fov_deg > 0.0 && self.input_fov_deg <= 360.0) {
            bail!("input fov must be in (0, 360], got {}", self.input_fov_deg);
        }
        if !(self.output_fov_deg > 0.0 && self.output_fov_deg < 180.0) {
            bail!("output fov must be in (0, 180), got {}", self.output_fov_deg);
        }
        for angle in [self.yaw_deg, self.pitch_deg, self.roll_deg] {
            if !angle.is_finite() {
                bail!("rotation angles must be finite");
            }
        }
        Ok(())
    }

    /// Half extents of the projection plane at z = 1.
    fn plane_ranges(&self) -> (f64, f64) {
        let (oh, ow) = self.output_shape;
        let y_range = (self.output_fov_deg.to_radians() / 2.0).tan();
        let x_range = y_range * (ow as f64 / oh as f64);
        (x_range, y_range)
    }
}

/// Per-destination-pixel source coordinates, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct RemapTable {
    pub width: usize,
    pub height: usize,
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
}

impl RemapTable {
    #[inline]
    pub fn source_at(&self, x: usize, y: usize) -> (f32, f32) {
        let idx = y * self.width + x;
        (self.map_x[idx], self.map_y[idx])
    }

    /// (min_x, max_x, min_y, max_y) over all finite entries.
    pub fn extent(&self) -> (f32, f32, f32, f32) {
        let mut ext = (f32::INFINITY, f32::NEG_INFINITY, f32::INFINITY, f32::NEG_INFINITY);
        for (&x, &y) in self.map_x.iter().zip(&self.map_y) {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            ext.0 = ext.0.min(x);
            ext.1 = ext.1.max(x);
            ext.2 = ext.2.min(y);
            ext.3 = ext.3.max(y);
        }
        ext
    }
}

pub fn rotation_x(deg: f64) -> Mat3 {
    let (s, c) = deg.to_radians().sin_cos();
    [[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]]
}

pub fn rotation_y(deg: f64) -> Mat3 {
    let (s, c) = deg.to_radians().sin_cos();
    [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]]
}

pub fn rotation_z(deg: f64) -> Mat3 {
    let (s, c) = deg.to_radians().sin_cos();
    [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]
}

pub fn mat_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// `Rz(roll) · Rx(pitch) · Ry(yaw)`.
pub fn rotation_matrix(yaw_deg: f64, pitch_deg: f64, roll_deg: f64) -> Mat3 {
    let rz_rx = mat_mul(&rotation_z(roll_deg), &rotation_x(pitch_deg));
    mat_mul(&rz_rx, &rotation_y(yaw_deg))
}

#[inline]
fn apply(r: &Mat3, v: [f64; 3]) -> [f64; 3] {
    [
        r[0][0] * v[0] + r[0][1] * v[1] + r[0][2] * v[2],
        r[1][0] * v[0] + r[1][1] * v[1] + r[1][2] * v[2],
        r[2][0] * v[0] + r[2][1] * v[1] + r[2][2] * v[2],
    ]
}

/// Spherical angles (θ, φ) of a ray: θ = atan2(y, x), φ = atan2(√(x²+y²), z).
#[inline]
pub fn spherical_angles(ray: [f64; 3]) -> (f64, f64) {
    let [x, y, z] = ray;
    let theta = y.atan2(x);
    let phi = (x * x + y * y).sqrt().atan2(z);
    (theta, phi)
}

struct Projector {
    rotation: Mat3,
    fisheye_h: f64,
    fisheye_w: f64,
    pixels_per_rad: f64,
}

impl Projector {
    fn new(params: &ProjectionParams) -> Self {
        let (ih, iw) = params.fisheye_shape;
        Self {
            rotation: rotation_matrix(params.yaw_deg, params.pitch_deg, params.roll_deg),
            fisheye_h: ih as f64,
            fisheye_w: iw as f64,
            pixels_per_rad: ih.min(iw) as f64 / params.input_fov_deg.to_radians(),
        }
    }

    #[inline]
    fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let (theta, phi) = spherical_angles(apply(&self.rotation, [x, y, 1.0]));
        let r = phi * self.pixels_per_rad;
        let src_x = 0.5 * self.fisheye_w + r * theta.cos();
        let src_y = 0.5 * self.fisheye_h - r * theta.sin();
        (src_x, src_y)
    }
}

fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (stop - start) / (n - 1) as f64;
    (0..n)
        .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
        .collect()
}

/// Builds the remap table for one view.
pub fn build_remap_table(params: &ProjectionParams) -> Result<RemapTable> {
    params.validate()?;
    let (oh, ow) = params.output_shape;
    let (x_range, y_range) = params.plane_ranges();
    let xs = linspace(-x_range, x_range, ow);
    // Image rows grow downwards while the camera y axis grows upwards.
    let ys = linspace(y_range, -y_range, oh);

    let projector = Projector::new(params);
    let mut map_x = Vec::with_capacity(ow * oh);
    let mut map_y = Vec::with_capacity(ow * oh);
    for &y in &ys {
        for &x in &xs {
            let (sx, sy) = projector.project(x, y);
            map_x.push(sx as f32);
            map_y.push(sy as f32);
        }
    }

    Ok(RemapTable {
        width: ow,
        height: oh,
        map_x,
        map_y,
    })
}

/// Projects the four corners of the output plane (TL, TR, BR, BL) onto the fisheye image.
pub fn view_footprint(params: &ProjectionParams) -> Result<[(f64, f64); 4]> {
    params.validate()?;
    let (x_range, y_range) = params.plane_ranges();
    let projector = Projector::new(params);
    Ok([
        projector.project(-x_range, y_range),
        projector.project(x_range, y_range),
        projector.project(x_range, -y_range),
        projector.project(-x_range, -y_range),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(output: (usize, usize), yaw: f64, pitch: f64, roll: f64) -> ProjectionParams {
        ProjectionParams {
            fisheye_shape: (1080, 1080),
            output_shape: output,
            input_fov_deg: 180.0,
            output_fov_deg: 90.0,
            yaw_deg: yaw,
            pitch_deg: pitch,
            roll_deg: roll,
        }
    }

    #[test]
    fn boresight_maps_to_fisheye_center() {
        let table = build_remap_table(&params((101, 101), 0.0, 0.0, 0.0)).unwrap();
        let (sx, sy) = table.source_at(50, 50);
        assert!((sx - 540.0).abs() < 1e-3, "sx={}", sx);
        assert!((sy - 540.0).abs() < 1e-3, "sy={}", sy);

        let ray = apply(&rotation_matrix(0.0, 0.0, 0.0), [0.0, 0.0, 1.0]);
        let (theta, phi) = spherical_angles(ray);
        assert_eq!(theta, 0.0);
        assert_eq!(phi, 0.0);
    }

    #[test]
    fn rotation_order_is_roll_pitch_yaw() {
        let r = rotation_matrix(30.0, 20.0, 10.0);
        let expected = mat_mul(
            &mat_mul(&rotation_z(10.0), &rotation_x(20.0)),
            &rotation_y(30.0),
        );
        assert_eq!(r, expected);
        let other_order = mat_mul(
            &mat_mul(&rotation_y(30.0), &rotation_x(20.0)),
            &rotation_z(10.0),
        );
        assert_ne!(r, other_order);
    }

    #[test]
    fn top_of_view_maps_to_top_of_fisheye() {
        let table = build_remap_table(&params((21, 21), 0.0, 0.0, 0.0)).unwrap();
        let (_, top_y) = table.source_at(10, 0);
        let (_, bottom_y) = table.source_at(10, 20);
        assert!(top_y < bottom_y);
    }

    #[test]
    fn footprint_matches_table_corners() {
        let p = params((48, 64), 0.0, 35.0, 135.0);
        let table = build_remap_table(&p).unwrap();
        let corners = view_footprint(&p).unwrap();
        let pixels = [(0, 0), (63, 0), (63, 47), (0, 47)];
        let (min_x, max_x, min_y, max_y) = table.extent();
        for ((cx, cy), (px, py)) in corners.iter().zip(pixels) {
            let (tx, ty) = table.source_at(px, py);
            assert!((*cx as f32 - tx).abs() < 1e-2);
            assert!((*cy as f32 - ty).abs() < 1e-2);
            assert!(*cx as f32 >= min_x - 1e-2 && *cx as f32 <= max_x + 1e-2);
            assert!(*cy as f32 >= min_y - 1e-2 && *cy as f32 <= max_y + 1e-2);
        }
    }

    #[test]
    fn wide_output_widens_horizontal_extent() {
        let square = build_remap_table(&params((32, 32), 0.0, 0.0, 0.0)).unwrap();
        let wide = build_remap_table(&params((32, 64), 0.0, 0.0, 0.0)).unwrap();
        let (sq_min, sq_max, _, _) = square.extent();
        let (w_min, w_max, _, _) = wide.extent();
        assert!(w_max - w_min > sq_max - sq_min);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut p = params((10, 10), 0.0, 0.0, 0.0);
        p.output_fov_deg = 180.0;
        assert!(build_remap_table(&p).is_err());
        let mut p = params((0, 10), 0.0, 0.0, 0.0);
        p.output_fov_deg = 90.0;
        assert!(build_remap_table(&p).is_err());
        let p = params((10, 10), f64::INFINITY, 0.0, 0.0);
        assert!(view_footprint(&p).is_err());
    }

    #[test]
    fn disabled_view_has_no_params() {
        assert!(ProjectionParams::for_view(&ViewConfig::Disabled, (10, 10), (10, 10), 180.0)
            .is_none());
        let p = ProjectionParams::for_view(
            &ViewConfig::active(45.0, 35.0, 80.0),
            (10, 10),
            (10, 10),
            180.0,
        )
        .unwrap();
        assert_eq!((p.yaw_deg, p.pitch_deg, p.roll_deg), (0.0, 35.0, 45.0));
    }
}
