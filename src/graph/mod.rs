//! Step graph and flow-control model.

pub mod flowchart;
pub mod step;

pub use flowchart::Flowchart;
pub use step::{
    ColorStep, CountCondition, CountStep, FlowAction, ImageStep, InjectStep, InputAction,
    LogicalStep, MatchAction, MotionCheckStep, NumberReadStep, Outcome, PointerStep, RunInfo,
    Step, StepPayload, StepState, TextSource, TypeTextStep, WaitStep,
};
