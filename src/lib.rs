//! Flowchart automation engine.
//!
//! Author a directed graph of detection and input steps, then replay it
//! against a live screen through host-provided capture/input drivers, with
//! conditional branching, timeouts, counters and failure recovery.

pub mod detect;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod expr;
pub mod graph;
pub mod market;
pub mod settings;

pub use engine::{
    create_engine_channels, Engine, EngineCommand, EngineEvent, EngineHandle, EngineState,
    StopReason,
};
pub use error::{DetectError, DriverError, EngineError};
pub use graph::{Flowchart, Step};
