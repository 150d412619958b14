//! OCR-backed numeric reads.
//!
//! The engine consumes OCR through the [`OcrEngine`] trait so the core builds
//! and tests without a tesseract installation; the `ocr` cargo feature
//! provides the tesseract-backed implementation.

use image::DynamicImage;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::template::{binarize, ColorMode};
use crate::error::DetectError;

/// Characters the OCR engine is allowed to emit for numeric reads.
pub const NUMERIC_WHITELIST: &str = "0123456789:;,.-";

/// Page segmentation mode passed to the OCR engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageSegMode {
    Auto,
    #[default]
    SingleBlock,
    SingleLine,
    SingleWord,
    SingleChar,
}

impl PageSegMode {
    pub fn as_variable(&self) -> &'static str {
        match self {
            PageSegMode::Auto => "3",
            PageSegMode::SingleBlock => "6",
            PageSegMode::SingleLine => "7",
            PageSegMode::SingleWord => "8",
            PageSegMode::SingleChar => "10",
        }
    }
}

/// Recognition engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecognitionMode {
    Legacy,
    Lstm,
    Combined,
    #[default]
    Default,
}

/// Options forwarded to the OCR engine for one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrOptions {
    pub psm: PageSegMode,
    pub oem: RecognitionMode,
    pub whitelist: String,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            psm: PageSegMode::default(),
            oem: RecognitionMode::default(),
            whitelist: NUMERIC_WHITELIST.to_string(),
        }
    }
}

/// Text recognition over a preprocessed capture.
pub trait OcrEngine: Send {
    fn recognize(
        &mut self,
        image: &DynamicImage,
        options: &OcrOptions,
    ) -> Result<String, DetectError>;
}

/// A successful numeric read: the parsed value and the raw engine output.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberRead {
    pub value: f64,
    pub raw: String,
}

/// Prepare a capture for recognition per the configured mode.
///
/// Grayscale inverts (screens are usually light-on-dark), binary additionally
/// applies a global threshold, color passes the capture through unchanged.
pub fn preprocess(img: &RgbImage, mode: ColorMode) -> DynamicImage {
    match mode {
        ColorMode::Color => DynamicImage::ImageRgb8(img.clone()),
        ColorMode::Gray => {
            let mut gray = DynamicImage::ImageRgb8(img.clone()).to_luma8();
            image::imageops::invert(&mut gray);
            DynamicImage::ImageLuma8(gray)
        }
        ColorMode::Binary => {
            let mut gray = DynamicImage::ImageRgb8(img.clone()).to_luma8();
            image::imageops::invert(&mut gray);
            DynamicImage::ImageLuma8(binarize(&gray))
        }
    }
}

/// Recognize a number in a capture.
///
/// Strips everything the engine returned down to digits, dot and minus before
/// parsing. An empty or unparseable remainder is a [`DetectError::NoNumberDetected`]
/// miss, not a fault.
pub fn read_number(
    engine: &mut dyn OcrEngine,
    img: &RgbImage,
    mode: ColorMode,
    options: &OcrOptions,
) -> Result<NumberRead, DetectError> {
    let processed = preprocess(img, mode);
    let raw = engine.recognize(&processed, options)?;

    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    if cleaned.is_empty() {
        return Err(DetectError::NoNumberDetected {
            raw: raw.trim().to_string(),
        });
    }

    let value: f64 = cleaned.parse().map_err(|_| DetectError::NoNumberDetected {
        raw: raw.trim().to_string(),
    })?;

    Ok(NumberRead { value, raw })
}

/// Tesseract-backed implementation, available with the `ocr` feature.
#[cfg(feature = "ocr")]
pub use tesseract_impl::TesseractOcr;

#[cfg(feature = "ocr")]
mod tesseract_impl {
    use super::*;
    use std::io::Cursor;
    use tesseract::{OcrEngineMode, Tesseract};

    /// OCR engine backed by a local tesseract installation.
    pub struct TesseractOcr {
        language: String,
    }

    impl TesseractOcr {
        /// Probe the installation; an unavailable engine is reported here so
        /// the host can disable number-reading steps instead of failing.
        pub fn new() -> Result<Self, DetectError> {
            Self::with_language("eng")
        }

        pub fn with_language(language: &str) -> Result<Self, DetectError> {
            Tesseract::new(None, Some(language)).map_err(|e| DetectError::Ocr(e.to_string()))?;
            Ok(Self {
                language: language.to_string(),
            })
        }

        fn engine_mode(oem: RecognitionMode) -> OcrEngineMode {
            match oem {
                RecognitionMode::Legacy => OcrEngineMode::TesseractOnly,
                RecognitionMode::Lstm => OcrEngineMode::LstmOnly,
                RecognitionMode::Combined => OcrEngineMode::TesseractLstmCombined,
                RecognitionMode::Default => OcrEngineMode::Default,
            }
        }
    }

    impl OcrEngine for TesseractOcr {
        fn recognize(
            &mut self,
            image: &DynamicImage,
            options: &OcrOptions,
        ) -> Result<String, DetectError> {
            let mut png = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                .map_err(|e| DetectError::Ocr(format!("failed to encode capture: {e}")))?;

            let mut tess = Tesseract::new_with_oem(
                None,
                Some(&self.language),
                Self::engine_mode(options.oem),
            )
            .map_err(|e| DetectError::Ocr(e.to_string()))?;
            tess = tess
                .set_variable("tessedit_pageseg_mode", options.psm.as_variable())
                .map_err(|e| DetectError::Ocr(e.to_string()))?;
            tess = tess
                .set_variable("tessedit_char_whitelist", &options.whitelist)
                .map_err(|e| DetectError::Ocr(e.to_string()))?;
            tess = tess
                .set_image_from_mem(&png)
                .map_err(|e| DetectError::Ocr(e.to_string()))?;

            tess.get_text().map_err(|e| DetectError::Ocr(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct CannedOcr {
        text: String,
    }

    impl OcrEngine for CannedOcr {
        fn recognize(
            &mut self,
            _image: &DynamicImage,
            _options: &OcrOptions,
        ) -> Result<String, DetectError> {
            Ok(self.text.clone())
        }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]))
    }

    #[test]
    fn test_read_number_strips_decorations() {
        let mut ocr = CannedOcr {
            text: "1,234 gp\n".to_string(),
        };
        let read = read_number(&mut ocr, &frame(), ColorMode::Gray, &OcrOptions::default())
            .unwrap();
        assert_eq!(read.value, 1234.0);
    }

    #[test]
    fn test_read_number_negative_and_decimal() {
        let mut ocr = CannedOcr {
            text: "-12.5".to_string(),
        };
        let read = read_number(&mut ocr, &frame(), ColorMode::Gray, &OcrOptions::default())
            .unwrap();
        assert_eq!(read.value, -12.5);
    }

    #[test]
    fn test_read_number_empty_is_miss() {
        let mut ocr = CannedOcr {
            text: "no digits here".to_string(),
        };
        let err = read_number(&mut ocr, &frame(), ColorMode::Gray, &OcrOptions::default())
            .unwrap_err();
        assert!(matches!(err, DetectError::NoNumberDetected { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_read_number_garbled_is_miss() {
        let mut ocr = CannedOcr {
            text: "1.2.3-".to_string(),
        };
        assert!(matches!(
            read_number(&mut ocr, &frame(), ColorMode::Gray, &OcrOptions::default()),
            Err(DetectError::NoNumberDetected { .. })
        ));
    }

    #[test]
    fn test_preprocess_gray_inverts() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
        let processed = preprocess(&img, ColorMode::Gray);
        let gray = processed.to_luma8();
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_preprocess_color_passthrough() {
        let img = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
        let processed = preprocess(&img, ColorMode::Color);
        assert_eq!(processed.to_rgb8().get_pixel(0, 0), &Rgb([1, 2, 3]));
    }
}
