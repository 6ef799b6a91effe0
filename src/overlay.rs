//! Drawing helpers for annotated outputs.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Footprint outline color (yellow).
pub const FOOTPRINT_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
/// Motion alert border color (red).
pub const ALERT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

fn stamp(img: &mut RgbImage, cx: i64, cy: i64, thickness: u32, color: Rgb<u8>) {
    let t = thickness.max(1) as i64;
    let lo = -(t - 1) / 2;
    let hi = t / 2;
    let (w, h) = (img.width() as i64, img.height() as i64);
    for dy in lo..=hi {
        for dx in lo..=hi {
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && y >= 0 && x < w && y < h {
                img.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

/// Bresenham line; pixels outside the image are clipped.
pub fn draw_line(
    img: &mut RgbImage,
    from: (i64, i64),
    to: (i64, i64),
    color: Rgb<u8>,
    thickness: u32,
) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        stamp(img, x, y, thickness, color);
        if (x, y) == to {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Draws a polyline through `points`, joining the last point back to the first when `closed`.
pub fn draw_polyline(
    img: &mut RgbImage,
    points: &[(i64, i64)],
    closed: bool,
    color: Rgb<u8>,
    thickness: u32,
) {
    for pair in points.windows(2) {
        draw_line(img, pair[0], pair[1], color, thickness);
    }
    if closed && points.len() > 2 {
        draw_line(img, points[points.len() - 1], points[0], color, thickness);
    }
}

/// Frames the image with a solid alert border.
pub fn draw_alert_border(img: &mut RgbImage) {
    let (w, h) = img.dimensions();
    let thickness = (w.min(h) / 100).max(4).min(w.min(h));
    for y in 0..h {
        for x in 0..w {
            if x < thickness || y < thickness || x >= w - thickness || y >= h - thickness {
                img.put_pixel(x, y, ALERT_COLOR);
            }
        }
    }
}

/// Fits `img` inside `target_w`×`target_h` without cropping, centered on black bars.
pub fn pad_to_size(img: &RgbImage, target_w: u32, target_h: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let mut canvas = RgbImage::new(target_w, target_h);
    if w == 0 || h == 0 || target_w == 0 || target_h == 0 {
        return canvas;
    }
    let scale = (target_w as f64 / w as f64).min(target_h as f64 / h as f64);
    let new_w = ((w as f64 * scale) as u32).clamp(1, target_w);
    let new_h = ((h as f64 * scale) as u32).clamp(1, target_h);
    let resized = if (new_w, new_h) == (w, h) {
        img.clone()
    } else {
        imageops::resize(img, new_w, new_h, FilterType::Triangle)
    };
    let start_x = (target_w - new_w) / 2;
    let start_y = (target_h - new_h) / 2;
    imageops::replace(&mut canvas, &resized, start_x as i64, start_y as i64);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pillarbox_centers_square_input() {
        let img = RgbImage::from_pixel(100, 100, Rgb([200, 10, 10]));
        let out = pad_to_size(&img, 640, 360);
        assert_eq!(out.dimensions(), (640, 360));
        // 360x360 content centered horizontally: bars of 140 px.
        assert_eq!(out.get_pixel(139, 180), &Rgb([0, 0, 0]));
        assert!(out.get_pixel(140, 180)[0] > 150);
        assert!(out.get_pixel(499, 180)[0] > 150);
        assert_eq!(out.get_pixel(500, 180), &Rgb([0, 0, 0]));
    }

    #[test]
    fn letterbox_keeps_full_width() {
        let img = RgbImage::from_pixel(400, 100, Rgb([9, 9, 9]));
        let out = pad_to_size(&img, 640, 360);
        assert_ne!(out.get_pixel(0, 180), &Rgb([0, 0, 0]));
        assert_ne!(out.get_pixel(639, 180), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(320, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn closed_polyline_returns_to_start() {
        let mut img = RgbImage::new(20, 20);
        draw_polyline(&mut img, &[(2, 2), (17, 2), (17, 17)], true, FOOTPRINT_COLOR, 1);
        assert_eq!(img.get_pixel(10, 2), &FOOTPRINT_COLOR);
        assert_eq!(img.get_pixel(17, 10), &FOOTPRINT_COLOR);
        // Closing edge runs along the diagonal.
        assert_eq!(img.get_pixel(10, 10), &FOOTPRINT_COLOR);
        assert_eq!(img.get_pixel(5, 15), &Rgb([0, 0, 0]));
    }

    #[test]
    fn lines_are_clipped_to_the_image() {
        let mut img = RgbImage::new(10, 10);
        draw_line(&mut img, (-50, 5), (50, 5), FOOTPRINT_COLOR, 3);
        assert_eq!(img.get_pixel(0, 4), &FOOTPRINT_COLOR);
        assert_eq!(img.get_pixel(9, 6), &FOOTPRINT_COLOR);
    }

    #[test]
    fn alert_border_leaves_interior_untouched() {
        let mut img = RgbImage::new(50, 50);
        draw_alert_border(&mut img);
        assert_eq!(img.get_pixel(0, 0), &ALERT_COLOR);
        assert_eq!(img.get_pixel(49, 25), &ALERT_COLOR);
        assert_eq!(img.get_pixel(25, 25), &Rgb([0, 0, 0]));
    }
}
