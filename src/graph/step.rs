//! The step entity: one node of the automation flowchart.

use std::time::Instant;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::detect::{
    ColorMode, ColorSpec, OcrOptions, Region, TemplateSource,
};
use crate::market::MarketField;

/// Where control flows after a step resolves.
///
/// `Goto` targets are 1-based step positions. A target past the last step or
/// at zero is a configuration error caught by validation before any run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    Next,
    Goto(usize),
    Stop,
}

impl FlowAction {
    /// The 0-based index this action moves to from `current`, or `None` for
    /// `Stop`.
    pub fn resolve(&self, current: usize) -> Option<usize> {
        match self {
            FlowAction::Next => Some(current + 1),
            FlowAction::Goto(target) => Some(target - 1),
            FlowAction::Stop => None,
        }
    }

    pub fn goto_target(&self) -> Option<usize> {
        match self {
            FlowAction::Goto(target) => Some(*target),
            _ => None,
        }
    }
}

/// An input-device action a step performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputAction {
    LeftClick,
    RightClick,
    MoveOnly,
    /// Click at the current pointer position without moving.
    ClickOnly,
    KeyPress(String),
}

/// Expression-over-count condition for count-mode detection steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountCondition {
    /// Two-token comparison evaluated against the instance count.
    pub expression: String,
    /// Consecutive false evaluations tolerated before the fail branch fires.
    pub max_cycles: u32,
}

impl Default for CountCondition {
    fn default() -> Self {
        Self {
            expression: ">= 1".to_string(),
            max_cycles: 1,
        }
    }
}

/// What a detection step does once its target is found: act on the match
/// position, or count instances against an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchAction {
    Input(InputAction),
    Count(CountCondition),
}

/// Color-detection step payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorStep {
    pub color: ColorSpec,
    /// Smallest contour area accepted as a blob.
    pub min_area: f64,
    /// Sample one fixed coordinate instead of scanning the region.
    pub pixel_probe: Option<(u32, u32)>,
    /// Capture rectangle; `None` means the global capture region.
    pub area: Option<Region>,
    pub on_match: MatchAction,
    /// Zero disables the timeout.
    pub timeout_secs: f64,
    pub on_timeout: FlowAction,
}

/// Template-detection step payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStep {
    pub source: TemplateSource,
    pub threshold: f32,
    pub color_mode: ColorMode,
    /// Folder mode: accept the first matching reference instead of the best.
    pub first_match_only: bool,
    pub area: Option<Region>,
    pub on_match: MatchAction,
    pub timeout_secs: f64,
    pub on_timeout: FlowAction,
}

/// Immediate input step payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerStep {
    pub action: InputAction,
    pub coords: (i32, i32),
}

/// Counter step: increments each visit, fires its own branch at the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountStep {
    /// Zero means count forever without a limit branch.
    pub max_count: u64,
    pub reset_on_start: bool,
    pub reset_on_reach: bool,
    pub on_count_reached: FlowAction,
    pub count_reached_delay_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitStep {
    pub duration_secs: f64,
    pub reset_on_start: bool,
}

/// Source of the text a [`TypeTextStep`] emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextSource {
    Static(String),
    Market(MarketField),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeTextStep {
    pub source: TextSource,
    /// Confirm with an enter keystroke after the configured delay.
    pub press_enter: bool,
    pub enter_delay_secs: f64,
}

/// Writes a value into a collaborator: the market panel or the settings
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InjectStep {
    Item { name: String, refresh: bool },
    Quantity { value: String, refresh: bool },
    Setting { name: String, value: String },
}

/// OCR numeric read evaluated against an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberReadStep {
    pub expression: String,
    pub area: Option<Region>,
    pub preprocess: ColorMode,
    pub ocr: OcrOptions,
    pub timeout_secs: f64,
    pub on_timeout: FlowAction,
}

/// Two-frame stillness check against the previous scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionCheckStep {
    /// Largest changed-pixel percentage still considered "still".
    pub tolerance_pct: f32,
    pub area: Option<Region>,
    pub reset_on_start: bool,
    pub timeout_secs: f64,
    pub on_timeout: FlowAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalStep {
    Count(CountStep),
    Wait(WaitStep),
    TypeText(TypeTextStep),
    Inject(InjectStep),
    NumberRead(NumberReadStep),
    MotionCheck(MotionCheckStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepPayload {
    Color(ColorStep),
    Image(ImageStep),
    Pointer(PointerStep),
    Logical(LogicalStep),
}

/// UI-visible result of a step's latest evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Running,
    Waiting,
    Success,
    Failed,
    TimedOut,
    CountReached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub outcome: Outcome,
    pub detail: String,
}

/// Transient per-step state. Never serialized; reset selectively when a run
/// starts.
#[derive(Debug, Clone, Default)]
pub struct StepState {
    pub last_run: Option<RunInfo>,
    /// Count-step counter, persistent across visits until reset.
    pub counter_value: u64,
    /// Wait-step timer start.
    pub wait_started: Option<Instant>,
    pub last_wait_secs: Option<f64>,
    /// Motion-check baseline frame from the previous cycle.
    pub baseline_frame: Option<GrayImage>,
    /// Consecutive misses of a count-mode detection step.
    pub miss_cycles: u32,
}

/// One node in the automation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Delay before the next step starts after an ordinary success.
    pub delay_after_secs: f64,
    pub on_success: FlowAction,
    pub payload: StepPayload,
    #[serde(skip)]
    pub state: StepState,
}

impl Step {
    pub fn new(name: impl Into<String>, payload: StepPayload) -> Self {
        Self {
            name: name.into(),
            delay_after_secs: 0.0,
            on_success: FlowAction::Next,
            payload,
            state: StepState::default(),
        }
    }

    pub fn with_delay(mut self, secs: f64) -> Self {
        self.delay_after_secs = secs;
        self
    }

    pub fn with_on_success(mut self, action: FlowAction) -> Self {
        self.on_success = action;
        self
    }

    /// Timeout seconds and fail branch, for step kinds that can time out.
    pub fn timeout_spec(&self) -> Option<(f64, FlowAction)> {
        match &self.payload {
            StepPayload::Color(s) => Some((s.timeout_secs, s.on_timeout)),
            StepPayload::Image(s) => Some((s.timeout_secs, s.on_timeout)),
            StepPayload::Logical(LogicalStep::NumberRead(s)) => {
                Some((s.timeout_secs, s.on_timeout))
            }
            StepPayload::Logical(LogicalStep::MotionCheck(s)) => {
                Some((s.timeout_secs, s.on_timeout))
            }
            _ => None,
        }
    }

    /// Every flow action this step can branch through. Used for validation
    /// and for re-linking targets when the graph is edited.
    pub fn flow_actions_mut(&mut self) -> Vec<&mut FlowAction> {
        let mut actions = vec![&mut self.on_success];
        match &mut self.payload {
            StepPayload::Color(s) => actions.push(&mut s.on_timeout),
            StepPayload::Image(s) => actions.push(&mut s.on_timeout),
            StepPayload::Logical(LogicalStep::Count(s)) => {
                actions.push(&mut s.on_count_reached);
            }
            StepPayload::Logical(LogicalStep::NumberRead(s)) => {
                actions.push(&mut s.on_timeout);
            }
            StepPayload::Logical(LogicalStep::MotionCheck(s)) => {
                actions.push(&mut s.on_timeout);
            }
            _ => {}
        }
        actions
    }

    pub fn flow_actions(&self) -> Vec<FlowAction> {
        let mut actions = vec![self.on_success];
        match &self.payload {
            StepPayload::Color(s) => actions.push(s.on_timeout),
            StepPayload::Image(s) => actions.push(s.on_timeout),
            StepPayload::Logical(LogicalStep::Count(s)) => actions.push(s.on_count_reached),
            StepPayload::Logical(LogicalStep::NumberRead(s)) => actions.push(s.on_timeout),
            StepPayload::Logical(LogicalStep::MotionCheck(s)) => actions.push(s.on_timeout),
            _ => {}
        }
        actions
    }
}
