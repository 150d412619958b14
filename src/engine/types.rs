//! Commands, events and run states for the execution engine.

use crate::graph::Outcome;

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop from the host or a hotkey.
    Requested,
    /// The run walked past the last step.
    Completed,
    /// A step's success branch was `Stop`.
    FlowStop { step: usize },
    /// A step's timeout/fail branch was `Stop`.
    TimeoutStop { step: usize },
    /// Unexpected failure inside dispatch.
    Error(String),
}

/// Scheduler state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped(StopReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Start { start_index: usize },
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started { start_index: usize },
    Stopped { reason: StopReason, message: String },
    /// A step became current.
    StepStarted { index: usize, name: String },
    /// A step's latest evaluation result, mirrored from its transient state.
    StepOutcome {
        index: usize,
        outcome: Outcome,
        detail: String,
    },
    /// Live "what am I doing now" line for a presentation layer.
    Status(String),
    /// Last detection attempt summary for a presentation layer.
    Detection(String),
    /// An inject step asked the host to refresh market prices.
    MarketRefreshRequested,
    Error(String),
}
