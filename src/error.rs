use std::path::PathBuf;
use thiserror::Error;

/// A specialized `Result` type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// The error type for scheduler-level operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Flowchart is empty, nothing to run")]
    EmptyFlowchart,

    #[error("Start step {index} is out of range for a flowchart of {len} step(s)")]
    InvalidStartStep { index: usize, len: usize },

    #[error("Step {step}: branch target {target} is out of range 1..={len}")]
    InvalidGotoTarget {
        step: usize,
        target: usize,
        len: usize,
    },

    #[error("Input driver failed: {source}")]
    Driver {
        #[from]
        source: DriverError,
    },

    #[error("Step index {index} is out of range during dispatch")]
    IndexOutOfRange { index: usize },
}

/// Errors from the detection primitives.
///
/// Most of these are local step failures: the scheduler routes them into the
/// step's fail branch or treats them as a miss for the tick, it never aborts
/// the run on them.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Invalid expression '{0}': expected an operator and a number, e.g. '>= 5'")]
    InvalidExpression(String),

    #[error("No number detected (raw OCR text: '{raw}')")]
    NoNumberDetected { raw: String },

    #[error("OCR engine failed: {0}")]
    Ocr(String),

    #[error("OCR engine is not available")]
    OcrUnavailable,

    #[error("Failed to load template {path:?}: {source}")]
    TemplateLoad {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Failed to read template directory {path:?}: {source}")]
    TemplateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Frame dimensions changed between captures: {previous:?} vs {current:?}")]
    FrameSizeMismatch {
        previous: (u32, u32),
        current: (u32, u32),
    },

    #[error("Capture region {width}x{height} has no pixels")]
    EmptyRegion { width: u32, height: u32 },
}

impl DetectError {
    /// Whether this error is a transient read failure (retried as a miss)
    /// rather than a configuration problem.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DetectError::NoNumberDetected { .. } | DetectError::Ocr(_) | DetectError::OcrUnavailable
        )
    }
}

/// Errors raised by the screen-capture and input collaborators.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Screen capture failed: {0}")]
    Capture(String),

    #[error("Input injection failed: {0}")]
    Input(String),
}
