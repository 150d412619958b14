//! Color-window matching and blob extraction.
//!
//! Matching builds a binary mask over the capture, extracts external contours
//! and filters them by area. HSV comparisons use OpenCV-style ranges (hue in
//! 0..180) with asymmetric tolerance scaling and hue wraparound.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, Contour};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

/// Color space used for tolerance comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    Rgb,
    #[default]
    Hsv,
}

/// A target color with its tolerance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSpec {
    pub rgb: [u8; 3],
    pub tolerance: u8,
    pub color_space: ColorSpace,
}

/// A located color blob: centroid in screen coordinates plus its contour
/// area, which doubles as the detection confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobFind {
    pub pos: (u32, u32),
    pub area: f64,
}

/// Convert RGB to HSV with OpenCV ranges: H in 0..=179, S and V in 0..=255.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let r = rgb[0] as f32 / 255.0;
    let g = rgb[1] as f32 / 255.0;
    let b = rgb[2] as f32 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { delta / max } else { 0.0 };
    let h_deg = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let h_deg = if h_deg < 0.0 { h_deg + 360.0 } else { h_deg };

    [
        (h_deg / 2.0).round().min(179.0) as u8,
        (s * 255.0).round() as u8,
        (v * 255.0).round() as u8,
    ]
}

/// Whether a single observed pixel falls inside the tolerance window.
pub fn pixel_matches(spec: &ColorSpec, observed: [u8; 3]) -> bool {
    match spec.color_space {
        ColorSpace::Rgb => {
            let tol = spec.tolerance as i32;
            spec.rgb
                .iter()
                .zip(observed.iter())
                .all(|(&t, &o)| (t as i32 - o as i32).abs() <= tol)
        }
        ColorSpace::Hsv => {
            let target = rgb_to_hsv(spec.rgb);
            let current = rgb_to_hsv(observed);
            let h_tol = (spec.tolerance as f32 * 1.8) as i32;
            let sv_tol = (spec.tolerance as f32 * 2.5) as i32;

            let h_diff = (target[0] as i32 - current[0] as i32).abs();
            let h_diff = h_diff.min(180 - h_diff);
            h_diff <= h_tol
                && (target[1] as i32 - current[1] as i32).abs() <= sv_tol
                && (target[2] as i32 - current[2] as i32).abs() <= sv_tol
        }
    }
}

/// Binary mask of pixels inside the tolerance window.
pub fn build_mask(img: &RgbImage, spec: &ColorSpec) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        Luma([if pixel_matches(spec, [p[0], p[1], p[2]]) {
            255
        } else {
            0
        }])
    })
}

fn external_contours(mask: &GrayImage) -> Vec<Contour<i32>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.parent.is_none())
        .collect()
}

/// Contour area via the shoelace formula, matching the convention that a
/// filled w×h rectangle's boundary encloses (w-1)×(h-1).
fn contour_area(points: &[Point<i32>]) -> f64 {
    signed_area(points).abs()
}

fn signed_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0i64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        sum += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    sum as f64 / 2.0
}

fn contour_centroid(points: &[Point<i32>]) -> Option<(f64, f64)> {
    let area = signed_area(points);
    if area == 0.0 {
        return None;
    }
    let mut cx = 0.0f64;
    let mut cy = 0.0f64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        let cross = a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
        cx += (a.x as f64 + b.x as f64) * cross;
        cy += (a.y as f64 + b.y as f64) * cross;
    }
    Some((cx / (6.0 * area), cy / (6.0 * area)))
}

/// Find the largest blob of the target color, if it clears `min_area`.
pub fn find_largest_blob(
    img: &RgbImage,
    offset: (u32, u32),
    spec: &ColorSpec,
    min_area: f64,
) -> Option<BlobFind> {
    let mask = build_mask(img, spec);
    let contours = external_contours(&mask);

    let largest = contours
        .iter()
        .max_by(|a, b| contour_area(&a.points).total_cmp(&contour_area(&b.points)))?;
    let area = contour_area(&largest.points);
    if area <= min_area {
        return None;
    }

    let (cx, cy) = contour_centroid(&largest.points)?;
    Some(BlobFind {
        pos: (
            (cx.round().max(0.0) as u32) + offset.0,
            (cy.round().max(0.0) as u32) + offset.1,
        ),
        area,
    })
}

/// Count every external blob of the target color above `min_area`.
pub fn count_blobs(img: &RgbImage, spec: &ColorSpec, min_area: f64) -> usize {
    let mask = build_mask(img, spec);
    external_contours(&mask)
        .iter()
        .filter(|c| contour_area(&c.points) > min_area)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn paint_square(img: &mut RgbImage, x0: u32, y0: u32, size: u32, color: [u8; 3]) {
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                img.put_pixel(x, y, Rgb(color));
            }
        }
    }

    #[test]
    fn test_rgb_to_hsv_primaries() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 0]), [0, 0, 0]);
    }

    #[test]
    fn test_pixel_matches_rgb_window() {
        let spec = ColorSpec {
            rgb: [100, 100, 100],
            tolerance: 5,
            color_space: ColorSpace::Rgb,
        };
        assert!(pixel_matches(&spec, [105, 95, 100]));
        assert!(!pixel_matches(&spec, [106, 100, 100]));
    }

    #[test]
    fn test_pixel_matches_hue_wraparound() {
        // Hue just below 180 must match a target hue at 0 within tolerance.
        let spec = ColorSpec {
            rgb: [255, 0, 0], // H = 0
            tolerance: 3,     // h_tol = 5
            color_space: ColorSpace::Hsv,
        };
        // H = 178: a red leaning slightly to magenta
        assert!(pixel_matches(&spec, [255, 0, 8]));
    }

    #[test]
    fn test_find_largest_blob_centroid_and_area() {
        let mut img = RgbImage::from_pixel(60, 60, Rgb([0, 0, 0]));
        paint_square(&mut img, 10, 10, 11, [255, 0, 0]);
        paint_square(&mut img, 40, 40, 5, [255, 0, 0]);

        let spec = ColorSpec {
            rgb: [255, 0, 0],
            tolerance: 2,
            color_space: ColorSpace::Hsv,
        };
        let blob = find_largest_blob(&img, (100, 0), &spec, 10.0).unwrap();
        // Centroid of the 11x11 square, shifted by the region offset.
        assert_eq!(blob.pos, (115, 15));
        assert_eq!(blob.area, 100.0);
    }

    #[test]
    fn test_find_largest_blob_respects_min_area() {
        let mut img = RgbImage::from_pixel(30, 30, Rgb([0, 0, 0]));
        paint_square(&mut img, 5, 5, 3, [0, 255, 0]);

        let spec = ColorSpec {
            rgb: [0, 255, 0],
            tolerance: 2,
            color_space: ColorSpace::Rgb,
        };
        assert!(find_largest_blob(&img, (0, 0), &spec, 10.0).is_none());
    }

    #[test]
    fn test_count_blobs() {
        let mut img = RgbImage::from_pixel(80, 80, Rgb([0, 0, 0]));
        paint_square(&mut img, 5, 5, 8, [0, 0, 255]);
        paint_square(&mut img, 30, 30, 8, [0, 0, 255]);
        paint_square(&mut img, 60, 60, 8, [0, 0, 255]);
        paint_square(&mut img, 70, 5, 2, [0, 0, 255]); // below min_area

        let spec = ColorSpec {
            rgb: [0, 0, 255],
            tolerance: 2,
            color_space: ColorSpace::Hsv,
        };
        assert_eq!(count_blobs(&img, &spec, 10.0), 3);
    }

    #[test]
    fn test_no_blobs_on_empty_mask() {
        let img = RgbImage::from_pixel(20, 20, Rgb([0, 0, 0]));
        let spec = ColorSpec {
            rgb: [255, 255, 0],
            tolerance: 1,
            color_space: ColorSpace::Rgb,
        };
        assert!(find_largest_blob(&img, (0, 0), &spec, 1.0).is_none());
        assert_eq!(count_blobs(&img, &spec, 1.0), 0);
    }
}
