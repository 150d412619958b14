//! Frame-difference stillness comparison.

use image::GrayImage;

use crate::error::DetectError;

/// Per-pixel difference below this is treated as noise, not change.
pub const DIFF_THRESHOLD: u8 = 30;

/// Percentage of pixels that changed between two frames of equal size.
///
/// Frames of different dimensions are a hard error for the comparison; the
/// caller resets its baseline and retries.
pub fn change_percentage(previous: &GrayImage, current: &GrayImage) -> Result<f32, DetectError> {
    if previous.dimensions() != current.dimensions() {
        return Err(DetectError::FrameSizeMismatch {
            previous: previous.dimensions(),
            current: current.dimensions(),
        });
    }

    let total = previous.as_raw().len();
    if total == 0 {
        return Ok(0.0);
    }

    let changed = previous
        .as_raw()
        .iter()
        .zip(current.as_raw().iter())
        .filter(|&(&a, &b)| a.abs_diff(b) > DIFF_THRESHOLD)
        .count();

    Ok(changed as f32 / total as f32 * 100.0)
}

/// Whether two frames differ by no more than `tolerance_pct` percent of
/// pixels. Returns the measured change percentage alongside the verdict.
pub fn is_still(
    previous: &GrayImage,
    current: &GrayImage,
    tolerance_pct: f32,
) -> Result<(bool, f32), DetectError> {
    let change = change_percentage(previous, current)?;
    Ok((change <= tolerance_pct, change))
}
