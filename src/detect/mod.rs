//! Detection subsystem: matching primitives and the async job service.
//!
//! The primitives are synchronous image routines; the scheduler runs the
//! expensive ones (template and color search) through [`DetectionService`]
//! workers so they never stall the tick loop.

pub mod color;
pub mod counting;
pub mod matcher;
pub mod motion;
pub mod ocr;
pub mod region;
pub mod service;
pub mod template;

// Re-export the main types and functions for easy access
pub use color::{BlobFind, ColorSpace, ColorSpec};
pub use counting::DEFAULT_MERGE_RATIO;
pub use matcher::{MatchHit, TemplateFind};
pub use ocr::{NumberRead, OcrEngine, OcrOptions, PageSegMode, RecognitionMode};
pub use region::Region;
pub use service::{Detection, DetectionService, JobToken};
pub use template::{ColorMode, ProcessedImage, Template, TemplateCache, TemplateSource};

#[cfg(feature = "ocr")]
pub use ocr::TesseractOcr;
