//! Template matching over preprocessed captures.
//!
//! Opaque grayscale templates go through `imageproc`'s normalized
//! cross-correlation, where a higher score is a better match and the score is
//! the confidence. Alpha-masked and full-color templates use a manual
//! normalized sum-of-squared-differences scan with early exit; there a lower
//! raw score is better and confidence is `1 - raw`.

use image::GrayImage;
use imageproc::template_matching::{match_template, MatchTemplateMethod};

use super::template::{ProcessedImage, Template};

/// A single accepted match, positioned at the template's top-left corner in
/// region coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchHit {
    pub x: u32,
    pub y: u32,
    pub confidence: f32,
}

/// A resolved find: the match center in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateFind {
    pub pos: (u32, u32),
    pub confidence: f32,
}

fn template_fits(screen: &ProcessedImage, template: &Template) -> bool {
    let (sw, sh) = screen.dimensions();
    let (tw, th) = template.dimensions();
    tw <= sw && th <= sh && tw > 0 && th > 0
}

/// Find the best-scoring position of a template, accepted only when its
/// confidence reaches the threshold.
pub fn best_hit(screen: &ProcessedImage, template: &Template, threshold: f32) -> Option<MatchHit> {
    if !template_fits(screen, template) {
        return None;
    }

    match (screen, &template.image, &template.mask) {
        (ProcessedImage::Gray(screen_gray), ProcessedImage::Gray(template_gray), None) => {
            let scores = match_template(
                screen_gray,
                template_gray,
                MatchTemplateMethod::CrossCorrelationNormalized,
            );
            let mut best: Option<MatchHit> = None;
            for (x, y, pixel) in scores.enumerate_pixels() {
                let confidence = pixel[0];
                if !confidence.is_finite() {
                    continue;
                }
                if best.is_none_or(|b| confidence > b.confidence) {
                    best = Some(MatchHit { x, y, confidence });
                }
            }
            best.filter(|hit| hit.confidence >= threshold)
        }
        _ => scan_best(screen, template, threshold),
    }
}

/// Collect every position whose confidence reaches the threshold. Used by
/// multi-instance counting, which must not exit early.
pub fn hits_above(screen: &ProcessedImage, template: &Template, threshold: f32) -> Vec<MatchHit> {
    if !template_fits(screen, template) {
        return Vec::new();
    }

    match (screen, &template.image, &template.mask) {
        (ProcessedImage::Gray(screen_gray), ProcessedImage::Gray(template_gray), None) => {
            let scores = match_template(
                screen_gray,
                template_gray,
                MatchTemplateMethod::CrossCorrelationNormalized,
            );
            let mut hits = Vec::new();
            for (x, y, pixel) in scores.enumerate_pixels() {
                let confidence = pixel[0];
                if confidence.is_finite() && confidence >= threshold {
                    hits.push(MatchHit { x, y, confidence });
                }
            }
            hits
        }
        _ => scan_hits(screen, template, threshold),
    }
}

/// Search one or more reference images and resolve to a screen-coordinate
/// center point.
///
/// With `first_match_only`, the first accepted reference short-circuits the
/// scan; otherwise the highest-confidence accepted match across all
/// references wins.
pub fn find_in_region(
    screen: &ProcessedImage,
    offset: (u32, u32),
    templates: &[Template],
    threshold: f32,
    first_match_only: bool,
) -> Option<TemplateFind> {
    let mut best: Option<TemplateFind> = None;

    for template in templates {
        let Some(hit) = best_hit(screen, template, threshold) else {
            continue;
        };
        let (tw, th) = template.dimensions();
        let found = TemplateFind {
            pos: (hit.x + tw / 2 + offset.0, hit.y + th / 2 + offset.1),
            confidence: hit.confidence,
        };
        if first_match_only {
            return Some(found);
        }
        if best.is_none_or(|b| found.confidence > b.confidence) {
            best = Some(found);
        }
    }

    best
}

/// Manual scan entry point for the masked / full-color paths.
fn scan_best(screen: &ProcessedImage, template: &Template, threshold: f32) -> Option<MatchHit> {
    let mut best: Option<MatchHit> = None;
    scan(screen, template, threshold, |hit| {
        if best.is_none_or(|b| hit.confidence > b.confidence) {
            best = Some(hit);
        }
    });
    best
}

fn scan_hits(screen: &ProcessedImage, template: &Template, threshold: f32) -> Vec<MatchHit> {
    let mut hits = Vec::new();
    scan(screen, template, threshold, |hit| hits.push(hit));
    hits
}

fn scan<F: FnMut(MatchHit)>(
    screen: &ProcessedImage,
    template: &Template,
    threshold: f32,
    mut accept: F,
) {
    let (screen_data, screen_channels) = screen.raw();
    let (template_data, template_channels) = template.image.raw();
    if screen_channels != template_channels {
        return;
    }
    let channels = screen_channels as usize;

    let (screen_w, _) = screen.dimensions();
    let (template_w, template_h) = template.dimensions();
    let (x_max, y_max) = (
        screen.width() - template_w,
        screen.height() - template_h,
    );

    // Mask must line up with the template pixel-for-pixel to participate.
    let mask = template
        .mask
        .as_ref()
        .filter(|m| m.dimensions() == template.dimensions());
    let included_pixels = match mask {
        Some(m) => m.as_raw().iter().filter(|&&v| v > 0).count(),
        None => (template_w * template_h) as usize,
    };
    if included_pixels == 0 {
        return;
    }

    let max_sq_diff = included_pixels as f64 * channels as f64 * 255.0 * 255.0;
    let max_allowed_diff = max_sq_diff * (1.0 - threshold.clamp(0.0, 1.0) as f64);

    for y in 0..=y_max {
        for x in 0..=x_max {
            if let Some(confidence) = score_at(
                screen_data,
                screen_w,
                template_data,
                template_w,
                template_h,
                channels,
                mask,
                x,
                y,
                max_sq_diff,
                max_allowed_diff,
            ) && confidence >= threshold
            {
                accept(MatchHit { x, y, confidence });
            }
        }
    }
}

/// Normalized squared-difference confidence at one position, with periodic
/// early exit once the threshold is out of reach.
#[allow(clippy::too_many_arguments)]
fn score_at(
    screen_data: &[u8],
    screen_w: u32,
    template_data: &[u8],
    template_w: u32,
    template_h: u32,
    channels: usize,
    mask: Option<&GrayImage>,
    x: u32,
    y: u32,
    max_sq_diff: f64,
    max_allowed_diff: f64,
) -> Option<f32> {
    let mut sum_sq_diff = 0.0f64;
    let mut checked = 0usize;

    for ty in 0..template_h {
        for tx in 0..template_w {
            if let Some(m) = mask
                && m.get_pixel(tx, ty)[0] == 0
            {
                continue;
            }

            let t_idx = ((ty * template_w + tx) as usize) * channels;
            let s_idx = (((y + ty) * screen_w + (x + tx)) as usize) * channels;

            for c in 0..channels {
                let diff = template_data[t_idx + c] as f64 - screen_data[s_idx + c] as f64;
                sum_sq_diff += diff * diff;
            }

            checked += 1;
            // Early exit: the remaining pixels can only add to the difference
            if checked % 1000 == 0 && sum_sq_diff > max_allowed_diff {
                return None;
            }
        }
    }

    let raw = sum_sq_diff / max_sq_diff;
    Some((1.0 - raw.clamp(0.0, 1.0)) as f32)
}
