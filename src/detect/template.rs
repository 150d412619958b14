//! Reference-image loading, preprocessing and caching.
//!
//! Templates are loaded once per `(path, color mode)` pair and kept for the
//! lifetime of the cache. Images carrying an alpha channel get a binary mask
//! built from it; the matcher uses the mask-aware scoring path for those.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{GrayImage, RgbImage};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use serde::{Deserialize, Serialize};

use crate::error::DetectError;

/// How captures and templates are reduced before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorMode {
    #[default]
    Gray,
    Color,
    /// Grayscale binarized with a global (Otsu) threshold.
    Binary,
}

/// Where a step's reference images come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemplateSource {
    /// A single image file.
    File(PathBuf),
    /// Every `.png` file in a directory.
    Folder(PathBuf),
}

impl TemplateSource {
    pub fn path(&self) -> &Path {
        match self {
            TemplateSource::File(p) | TemplateSource::Folder(p) => p,
        }
    }
}

/// A capture or reference image reduced per [`ColorMode`].
#[derive(Debug, Clone)]
pub enum ProcessedImage {
    Gray(GrayImage),
    Color(RgbImage),
}

impl ProcessedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ProcessedImage::Gray(img) => img.dimensions(),
            ProcessedImage::Color(img) => img.dimensions(),
        }
    }

    pub fn width(&self) -> u32 {
        self.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.dimensions().1
    }

    /// Raw channel data plus channel count, for the manual scoring scan.
    pub fn raw(&self) -> (&[u8], u32) {
        match self {
            ProcessedImage::Gray(img) => (img.as_raw(), 1),
            ProcessedImage::Color(img) => (img.as_raw(), 3),
        }
    }
}

/// Binarize a grayscale image with an automatic global threshold.
pub fn binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    threshold(gray, level, ThresholdType::Binary)
}

/// Reduce a captured region per the configured color mode.
pub fn preprocess_screen(screen: &RgbImage, mode: ColorMode) -> ProcessedImage {
    match mode {
        ColorMode::Color => ProcessedImage::Color(screen.clone()),
        ColorMode::Gray => {
            ProcessedImage::Gray(image::DynamicImage::ImageRgb8(screen.clone()).to_luma8())
        }
        ColorMode::Binary => {
            let gray = image::DynamicImage::ImageRgb8(screen.clone()).to_luma8();
            ProcessedImage::Gray(binarize(&gray))
        }
    }
}

/// A loaded reference image, preprocessed and ready to match.
#[derive(Debug, Clone)]
pub struct Template {
    pub path: PathBuf,
    pub name: String,
    pub image: ProcessedImage,
    /// Binary mask built from the alpha channel, if the source image had one.
    pub mask: Option<GrayImage>,
}

impl Template {
    pub fn load(path: &Path, mode: ColorMode) -> Result<Self, DetectError> {
        let img = image::open(path).map_err(|source| DetectError::TemplateLoad {
            path: path.to_path_buf(),
            source,
        })?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let mask = if img.color().has_alpha() {
            let rgba = img.to_rgba8();
            Some(GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
                let alpha = rgba.get_pixel(x, y)[3];
                image::Luma([if alpha > 1 { 255 } else { 0 }])
            }))
        } else {
            None
        };

        let image = match mode {
            ColorMode::Color => ProcessedImage::Color(img.to_rgb8()),
            ColorMode::Gray => ProcessedImage::Gray(img.to_luma8()),
            ColorMode::Binary => ProcessedImage::Gray(binarize(&img.to_luma8())),
        };

        Ok(Self {
            path: path.to_path_buf(),
            name,
            image,
            mask,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Cache of loaded template sets keyed by source path and color mode.
#[derive(Debug, Default)]
pub struct TemplateCache {
    entries: HashMap<(PathBuf, ColorMode), Arc<Vec<Template>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a step's template source, loading and caching on first use.
    pub fn resolve(
        &mut self,
        source: &TemplateSource,
        mode: ColorMode,
    ) -> Result<Arc<Vec<Template>>, DetectError> {
        let key = (source.path().to_path_buf(), mode);
        if let Some(cached) = self.entries.get(&key) {
            return Ok(Arc::clone(cached));
        }

        let templates = match source {
            TemplateSource::File(path) => vec![Template::load(path, mode)?],
            TemplateSource::Folder(dir) => Self::load_folder(dir, mode)?,
        };

        let templates = Arc::new(templates);
        self.entries.insert(key, Arc::clone(&templates));
        Ok(templates)
    }

    fn load_folder(dir: &Path, mode: ColorMode) -> Result<Vec<Template>, DetectError> {
        let entries = std::fs::read_dir(dir).map_err(|source| DetectError::TemplateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("png"))
            })
            .collect();
        // Sort for consistent ordering
        paths.sort();

        let mut templates = Vec::new();
        for path in paths {
            match Template::load(&path, mode) {
                Ok(template) => templates.push(template),
                Err(e) => {
                    log::warn!("Skipping unreadable template: {e}");
                }
            }
        }
        Ok(templates)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_gray_dimensions() {
        let screen = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
        let processed = preprocess_screen(&screen, ColorMode::Gray);
        assert_eq!(processed.dimensions(), (8, 4));
        let (_, channels) = processed.raw();
        assert_eq!(channels, 1);
    }

    #[test]
    fn test_preprocess_color_keeps_channels() {
        let screen = RgbImage::from_pixel(4, 4, Rgb([200, 0, 0]));
        let processed = preprocess_screen(&screen, ColorMode::Color);
        let (raw, channels) = processed.raw();
        assert_eq!(channels, 3);
        assert_eq!(raw.len(), 4 * 4 * 3);
    }

    #[test]
    fn test_binarize_splits_dark_and_bright() {
        let mut gray = GrayImage::from_pixel(4, 2, image::Luma([10]));
        for x in 0..4 {
            gray.put_pixel(x, 1, image::Luma([240]));
        }
        let binary = binarize(&gray);
        assert_eq!(binary.get_pixel(0, 0)[0], 0);
        assert_eq!(binary.get_pixel(0, 1)[0], 255);
    }
}
