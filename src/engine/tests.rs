//! End-to-end scheduler tests against fake capture and input drivers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use image::{DynamicImage, Rgb, RgbImage};
use tokio::time::{timeout, Duration};

use crate::detect::ocr::{OcrEngine, OcrOptions};
use crate::detect::{ColorSpace, ColorSpec, Region, TemplateSource};
use crate::drivers::{InputDriver, RunFlag, ScreenCapture};
use crate::engine::channels::create_engine_channels;
use crate::engine::scheduler::{Engine, EngineHandle};
use crate::engine::types::{EngineEvent, StopReason};
use crate::error::{DetectError, DriverError};
use crate::graph::{
    ColorStep, CountCondition, CountStep, FlowAction, Flowchart, ImageStep, InjectStep,
    InputAction, LogicalStep, MatchAction, MotionCheckStep, NumberReadStep, Outcome, PointerStep,
    Step, StepPayload, TextSource, TypeTextStep, WaitStep,
};
use crate::market::MarketField;
use crate::settings::{keys, SettingValue, SettingsRegistry};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ----- fakes ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum InputEvent {
    Move(i32, i32),
    Click,
    RightClick,
    Press(String),
    Write(String),
}

#[derive(Clone, Default)]
struct InputLog(Arc<Mutex<Vec<InputEvent>>>);

impl InputLog {
    fn events(&self) -> Vec<InputEvent> {
        self.0.lock().unwrap().clone()
    }
}

struct FakeInput {
    log: InputLog,
    /// Emulate a stop request landing while the pointer is in flight.
    interrupt_on_move: bool,
}

impl FakeInput {
    fn new(log: InputLog) -> Self {
        Self {
            log,
            interrupt_on_move: false,
        }
    }
}

impl InputDriver for FakeInput {
    fn move_to(
        &mut self,
        x: i32,
        y: i32,
        _duration: Duration,
        run: &RunFlag,
    ) -> Result<(), DriverError> {
        self.log.0.lock().unwrap().push(InputEvent::Move(x, y));
        if self.interrupt_on_move {
            run.set(false);
        }
        Ok(())
    }

    fn click(&mut self) -> Result<(), DriverError> {
        self.log.0.lock().unwrap().push(InputEvent::Click);
        Ok(())
    }

    fn right_click(&mut self) -> Result<(), DriverError> {
        self.log.0.lock().unwrap().push(InputEvent::RightClick);
        Ok(())
    }

    fn press(&mut self, key: &str) -> Result<(), DriverError> {
        self.log
            .0
            .lock()
            .unwrap()
            .push(InputEvent::Press(key.to_string()));
        Ok(())
    }

    fn write(&mut self, text: &str) -> Result<(), DriverError> {
        self.log
            .0
            .lock()
            .unwrap()
            .push(InputEvent::Write(text.to_string()));
        Ok(())
    }
}

/// Serves crops of one fixed frame and counts capture calls.
struct FrameCapture {
    frame: RgbImage,
    calls: Arc<Mutex<usize>>,
}

impl FrameCapture {
    fn solid(color: [u8; 3]) -> (Self, Arc<Mutex<usize>>) {
        Self::of_frame(RgbImage::from_pixel(64, 64, Rgb(color)))
    }

    fn of_frame(frame: RgbImage) -> (Self, Arc<Mutex<usize>>) {
        let calls = Arc::new(Mutex::new(0));
        (
            Self {
                frame,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl ScreenCapture for FrameCapture {
    fn capture(&mut self, region: Region) -> Result<RgbImage, DriverError> {
        *self.calls.lock().unwrap() += 1;
        if region.x + region.width > self.frame.width()
            || region.y + region.height > self.frame.height()
        {
            return Err(DriverError::Capture("region out of bounds".to_string()));
        }
        Ok(image::imageops::crop_imm(
            &self.frame,
            region.x,
            region.y,
            region.width,
            region.height,
        )
        .to_image())
    }
}

struct FakeOcr {
    responses: VecDeque<String>,
    last: String,
}

impl FakeOcr {
    fn new(responses: &[&str]) -> Self {
        let mut queue: VecDeque<String> = responses.iter().map(|s| s.to_string()).collect();
        let last = queue.back().cloned().unwrap_or_default();
        // keep the final response as the steady state
        let _ = queue.pop_back();
        Self {
            responses: queue,
            last,
        }
    }
}

impl OcrEngine for FakeOcr {
    fn recognize(
        &mut self,
        _image: &DynamicImage,
        _options: &OcrOptions,
    ) -> Result<String, DetectError> {
        Ok(self.responses.pop_front().unwrap_or_else(|| self.last.clone()))
    }
}

// ----- harness -------------------------------------------------------------

struct TestRig {
    handle: EngineHandle,
    events: tokio::sync::mpsc::Receiver<EngineEvent>,
    task: tokio::task::JoinHandle<Engine>,
}

fn fast_settings() -> SettingsRegistry {
    let mut settings = SettingsRegistry::with_defaults();
    settings.register(keys::SCAN_INTERVAL, SettingValue::Float(0.005));
    settings.register(keys::MOUSE_SPEED, SettingValue::Float(0.0));
    settings
}

fn spawn_engine(
    flow: Flowchart,
    capture: Box<dyn ScreenCapture>,
    input: Box<dyn InputDriver>,
    ocr: Option<Box<dyn OcrEngine>>,
) -> TestRig {
    init_logging();
    let (cmd_tx, cmd_rx, event_tx, event_rx) = create_engine_channels();
    let mut engine = Engine::new(
        flow,
        capture,
        input,
        Region::new(0, 0, 64, 64),
        cmd_rx,
        event_tx,
    )
    .with_settings(fast_settings());
    if let Some(ocr) = ocr {
        engine = engine.with_ocr(ocr);
    }
    let handle = engine.handle(cmd_tx);
    let task = tokio::spawn(async move {
        engine.run().await;
        engine
    });
    TestRig {
        handle,
        events: event_rx,
        task,
    }
}

async fn next_event(rig: &mut TestRig) -> EngineEvent {
    timeout(Duration::from_secs(5), rig.events.recv())
        .await
        .expect("timed out waiting for an engine event")
        .expect("event channel closed")
}

/// Drain events until the run stops, returning the reason and everything seen.
async fn wait_for_stop(rig: &mut TestRig) -> (StopReason, Vec<EngineEvent>) {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rig).await;
        seen.push(event.clone());
        if let EngineEvent::Stopped { reason, .. } = event {
            return (reason, seen);
        }
    }
}

async fn finish(mut rig: TestRig) -> Engine {
    rig.handle.shutdown().await;
    timeout(Duration::from_secs(5), rig.task)
        .await
        .expect("engine task did not shut down")
        .expect("engine task panicked")
}

fn outcomes_for(events: &[EngineEvent], step: usize) -> Vec<Outcome> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StepOutcome { index, outcome, .. } if *index == step => Some(*outcome),
            _ => None,
        })
        .collect()
}

fn pointer_step(name: &str, action: InputAction, coords: (i32, i32)) -> Step {
    Step::new(name, StepPayload::Pointer(PointerStep { action, coords }))
}

// ----- tests ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pointer_chain_runs_to_completion() {
    let flow = Flowchart::from_steps(vec![
        pointer_step("click ok", InputAction::LeftClick, (10, 20)),
        pointer_step("confirm", InputAction::KeyPress("enter".to_string()), (0, 0)),
    ]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Completed);
    assert_eq!(
        log.events(),
        vec![
            InputEvent::Move(10, 20),
            InputEvent::Click,
            InputEvent::Press("enter".to_string()),
        ]
    );
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_goto_lands_on_one_based_target() {
    // Step 1 jumps to step 3; step 2 must never run.
    let flow = Flowchart::from_steps(vec![
        pointer_step("jump", InputAction::MoveOnly, (1, 1)).with_on_success(FlowAction::Goto(3)),
        pointer_step("skipped", InputAction::KeyPress("x".to_string()), (0, 0)),
        pointer_step("landed", InputAction::KeyPress("z".to_string()), (0, 0))
            .with_on_success(FlowAction::Stop),
    ]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::FlowStop { step: 2 });
    assert_eq!(
        log.events(),
        vec![InputEvent::Move(1, 1), InputEvent::Press("z".to_string())]
    );
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_count_step_fires_count_reached_once_per_limit() {
    let flow = Flowchart::from_steps(vec![Step::new(
        "visits",
        StepPayload::Logical(LogicalStep::Count(CountStep {
            max_count: 3,
            reset_on_start: true,
            reset_on_reach: false,
            on_count_reached: FlowAction::Stop,
            count_reached_delay_secs: 0.0,
        })),
    )
    .with_on_success(FlowAction::Goto(1))]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log)),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::FlowStop { step: 0 });

    let outcomes = outcomes_for(&events, 0);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == Outcome::CountReached)
            .count(),
        1
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == Outcome::Success).count(),
        2
    );

    let engine = finish(rig).await;
    assert_eq!(engine.flowchart().get(0).unwrap().state.counter_value, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_color_count_fail_branch_fires_on_third_cycle() {
    let flow = Flowchart::from_steps(vec![Step::new(
        "expect blobs",
        StepPayload::Color(ColorStep {
            color: ColorSpec {
                rgb: [255, 0, 0],
                tolerance: 2,
                color_space: ColorSpace::Hsv,
            },
            min_area: 10.0,
            pixel_probe: None,
            area: Some(Region::new(0, 0, 32, 32)),
            on_match: MatchAction::Count(CountCondition {
                expression: ">= 1".to_string(),
                max_cycles: 3,
            }),
            timeout_secs: 0.0,
            on_timeout: FlowAction::Stop,
        }),
    )]);
    let log = InputLog::default();
    let (capture, calls) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log)),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::TimeoutStop { step: 0 });

    // Three scans, three false evaluations, fail branch on the third.
    assert_eq!(*calls.lock().unwrap(), 3);
    let outcomes = outcomes_for(&events, 0);
    assert_eq!(
        outcomes.iter().filter(|o| **o == Outcome::Failed).count(),
        4, // one per miss cycle plus the final fail-branch record
    );
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_from_two_threads_tears_down_once() {
    let flow = Flowchart::from_steps(vec![Step::new(
        "long wait",
        StepPayload::Logical(LogicalStep::Wait(WaitStep {
            duration_secs: 30.0,
            reset_on_start: true,
        })),
    )]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log)),
        None,
    );

    assert!(rig.handle.start(0).await);
    // Let the run actually begin before stopping it.
    loop {
        if matches!(next_event(&mut rig).await, EngineEvent::StepStarted { .. }) {
            break;
        }
    }

    let h1 = rig.handle.clone();
    let h2 = rig.handle.clone();
    let t1 = std::thread::spawn(move || h1.stop());
    let t2 = std::thread::spawn(move || h2.stop());
    let initiated: Vec<bool> = vec![t1.join().unwrap(), t2.join().unwrap()];
    assert_eq!(
        initiated.iter().filter(|&&won| won).count(),
        1,
        "exactly one caller may initiate teardown"
    );

    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Requested);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Stopped { .. }))
            .count(),
        1
    );
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_mid_move_suppresses_the_click() {
    let flow = Flowchart::from_steps(vec![pointer_step(
        "click target",
        InputAction::LeftClick,
        (50, 50),
    )]);
    let log = InputLog::default();
    let mut input = FakeInput::new(log.clone());
    input.interrupt_on_move = true;
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(flow, Box::new(capture), Box::new(input), None);

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Requested);
    // The move happened; the click it would have committed did not.
    assert_eq!(log.events(), vec![InputEvent::Move(50, 50)]);
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_step_resolves_after_duration() {
    let flow = Flowchart::from_steps(vec![
        Step::new(
            "short wait",
            StepPayload::Logical(LogicalStep::Wait(WaitStep {
                duration_secs: 0.05,
                reset_on_start: true,
            })),
        ),
        pointer_step("after", InputAction::KeyPress("w".to_string()), (0, 0))
            .with_on_success(FlowAction::Stop),
    ]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::FlowStop { step: 1 });
    assert!(outcomes_for(&events, 0).contains(&Outcome::Waiting));
    assert_eq!(log.events(), vec![InputEvent::Press("w".to_string())]);

    let engine = finish(rig).await;
    let state = &engine.flowchart().get(0).unwrap().state;
    assert!(state.wait_started.is_none(), "timer cleared after success");
    assert!(state.last_wait_secs.unwrap() >= 0.05);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_image_step_times_out_into_fail_branch() {
    let flow = Flowchart::from_steps(vec![
        Step::new(
            "never found",
            StepPayload::Image(ImageStep {
                source: TemplateSource::File("/nonexistent/reference.png".into()),
                threshold: 0.9,
                color_mode: Default::default(),
                first_match_only: false,
                area: Some(Region::new(0, 0, 32, 32)),
                on_match: MatchAction::Input(InputAction::LeftClick),
                timeout_secs: 0.05,
                on_timeout: FlowAction::Next,
            }),
        ),
        pointer_step("fallback", InputAction::KeyPress("f".to_string()), (0, 0))
            .with_on_success(FlowAction::Stop),
    ]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::FlowStop { step: 1 });
    assert!(outcomes_for(&events, 0).contains(&Outcome::TimedOut));
    // The fail branch performs no success action for the timed-out step.
    assert_eq!(log.events(), vec![InputEvent::Press("f".to_string())]);
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inject_and_type_text_through_market_panel() {
    let flow = Flowchart::from_steps(vec![
        Step::new(
            "set item",
            StepPayload::Logical(LogicalStep::Inject(InjectStep::Item {
                name: "Dragon bones".to_string(),
                refresh: true,
            })),
        ),
        Step::new(
            "set quantity",
            StepPayload::Logical(LogicalStep::Inject(InjectStep::Quantity {
                value: "1,234".to_string(),
                refresh: false,
            })),
        ),
        Step::new(
            "type item",
            StepPayload::Logical(LogicalStep::TypeText(TypeTextStep {
                source: TextSource::Market(MarketField::ItemName),
                press_enter: true,
                enter_delay_secs: 0.0,
            })),
        ),
        Step::new(
            "type quantity",
            StepPayload::Logical(LogicalStep::TypeText(TypeTextStep {
                source: TextSource::Market(MarketField::Quantity),
                press_enter: false,
                enter_delay_secs: 0.0,
            })),
        ),
    ]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Completed);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::MarketRefreshRequested))
            .count(),
        1
    );
    assert_eq!(
        log.events(),
        vec![
            InputEvent::Write("Dragon bones".to_string()),
            InputEvent::Press("enter".to_string()),
            // Typed quantities drop the thousands separators.
            InputEvent::Write("1234".to_string()),
        ]
    );

    let engine = finish(rig).await;
    let market = engine.market();
    let panel = market.lock().unwrap();
    assert_eq!(panel.item_name, "Dragon bones");
    assert_eq!(panel.quantity, "1,234");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inject_setting_parse_failure_has_no_branch() {
    let flow = Flowchart::from_steps(vec![Step::new(
        "bad inject",
        StepPayload::Logical(LogicalStep::Inject(InjectStep::Setting {
            name: keys::LOC_OFFSET_VARIANCE.to_string(),
            value: "not a number".to_string(),
        })),
    )]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log)),
        None,
    );

    assert!(rig.handle.start(0).await);
    // The step resolves false and dwells; it never branches or aborts.
    loop {
        if let EngineEvent::StepOutcome { outcome, .. } = next_event(&mut rig).await
            && outcome == Outcome::Failed
        {
            break;
        }
    }
    assert!(rig.handle.stop());
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Requested);

    let engine = finish(rig).await;
    assert_eq!(
        engine.settings().get(keys::LOC_OFFSET_VARIANCE),
        Some(SettingValue::Int(4)),
        "failed inject must leave the cell unchanged"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_rejects_invalid_goto_target() {
    let flow = Flowchart::from_steps(vec![
        pointer_step("dangling", InputAction::MoveOnly, (0, 0))
            .with_on_success(FlowAction::Goto(5)),
    ]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    match next_event(&mut rig).await {
        EngineEvent::Error(message) => assert!(message.contains("target 5")),
        other => panic!("expected a start rejection, got {other:?}"),
    }
    assert!(log.events().is_empty());
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_motion_check_sliding_two_frame_window() {
    let flow = Flowchart::from_steps(vec![Step::new(
        "settle",
        StepPayload::Logical(LogicalStep::MotionCheck(MotionCheckStep {
            tolerance_pct: 5.0,
            area: Some(Region::new(0, 0, 16, 16)),
            reset_on_start: true,
            timeout_secs: 0.0,
            on_timeout: FlowAction::Stop,
        })),
    )]);
    let log = InputLog::default();
    let (capture, calls) = FrameCapture::solid([120, 120, 120]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log)),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Completed);

    let outcomes = outcomes_for(&events, 0);
    assert_eq!(outcomes, vec![Outcome::Waiting, Outcome::Success]);
    assert_eq!(*calls.lock().unwrap(), 2, "baseline frame plus comparison");

    let engine = finish(rig).await;
    assert!(
        engine
            .flowchart()
            .get(0)
            .unwrap()
            .state
            .baseline_frame
            .is_none(),
        "baseline cleared after every comparison"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_number_read_retries_until_expression_holds() {
    let flow = Flowchart::from_steps(vec![Step::new(
        "read total",
        StepPayload::Logical(LogicalStep::NumberRead(NumberReadStep {
            expression: "> 100".to_string(),
            area: Some(Region::new(0, 0, 32, 16)),
            preprocess: Default::default(),
            ocr: OcrOptions::default(),
            timeout_secs: 0.0,
            on_timeout: FlowAction::Stop,
        })),
    )]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let ocr = FakeOcr::new(&["42", "no digits", "150"]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log)),
        Some(Box::new(ocr)),
    );

    assert!(rig.handle.start(0).await);
    let (reason, events) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Completed);

    let outcomes = outcomes_for(&events, 0);
    assert_eq!(outcomes.last(), Some(&Outcome::Success));
    assert!(outcomes.contains(&Outcome::Failed), "42 must miss first");
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_color_detect_clicks_blob_centroid() {
    let mut frame = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
    for y in 10..21 {
        for x in 10..21 {
            frame.put_pixel(x, y, Rgb([255, 0, 0]));
        }
    }
    let flow = Flowchart::from_steps(vec![Step::new(
        "find red",
        StepPayload::Color(ColorStep {
            color: ColorSpec {
                rgb: [255, 0, 0],
                tolerance: 2,
                color_space: ColorSpace::Hsv,
            },
            min_area: 10.0,
            pixel_probe: None,
            area: None,
            on_match: MatchAction::Input(InputAction::LeftClick),
            timeout_secs: 0.0,
            on_timeout: FlowAction::Stop,
        }),
    )
    .with_on_success(FlowAction::Stop)]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::of_frame(frame);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::FlowStop { step: 0 });
    assert_eq!(
        log.events(),
        vec![InputEvent::Move(15, 15), InputEvent::Click]
    );
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pixel_probe_matches_without_region_scan() {
    let mut frame = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
    frame.put_pixel(33, 44, Rgb([10, 200, 30]));

    let flow = Flowchart::from_steps(vec![Step::new(
        "probe pixel",
        StepPayload::Color(ColorStep {
            color: ColorSpec {
                rgb: [10, 200, 30],
                tolerance: 2,
                color_space: ColorSpace::Rgb,
            },
            min_area: 10.0,
            pixel_probe: Some((33, 44)),
            area: None,
            on_match: MatchAction::Input(InputAction::MoveOnly),
            timeout_secs: 0.0,
            on_timeout: FlowAction::Stop,
        }),
    )
    .with_on_success(FlowAction::Stop)]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::of_frame(frame);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::FlowStop { step: 0 });
    assert_eq!(log.events(), vec![InputEvent::Move(33, 44)]);
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_image_detect_moves_to_template_center() {
    // Write a reference patch to disk, then present a frame containing it.
    let patch = RgbImage::from_fn(16, 16, |x, y| {
        Rgb([
            ((x * 37 + y * 11) % 251) as u8,
            ((x * 13 + y * 29) % 251) as u8,
            ((x * 7 + y * 3) % 251) as u8,
        ])
    });
    let path = std::env::temp_dir().join(format!(
        "flowclick-ref-{}.png",
        std::process::id()
    ));
    patch.save(&path).unwrap();

    let mut frame = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
    for (x, y, p) in patch.enumerate_pixels() {
        frame.put_pixel(20 + x, 12 + y, *p);
    }

    let flow = Flowchart::from_steps(vec![Step::new(
        "find patch",
        StepPayload::Image(ImageStep {
            source: TemplateSource::File(path.clone()),
            threshold: 0.95,
            color_mode: Default::default(),
            first_match_only: true,
            area: None,
            on_match: MatchAction::Input(InputAction::MoveOnly),
            timeout_secs: 0.0,
            on_timeout: FlowAction::Stop,
        }),
    )
    .with_on_success(FlowAction::Stop)]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::of_frame(frame);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    let _ = std::fs::remove_file(&path);
    assert_eq!(reason, StopReason::FlowStop { step: 0 });
    assert_eq!(log.events(), vec![InputEvent::Move(28, 20)]);
    finish(rig).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_after_stop_reuses_the_engine() {
    let flow = Flowchart::from_steps(vec![pointer_step(
        "tap",
        InputAction::ClickOnly,
        (0, 0),
    )]);
    let log = InputLog::default();
    let (capture, _) = FrameCapture::solid([0, 0, 0]);
    let mut rig = spawn_engine(
        flow,
        Box::new(capture),
        Box::new(FakeInput::new(log.clone())),
        None,
    );

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Completed);

    assert!(rig.handle.start(0).await);
    let (reason, _) = wait_for_stop(&mut rig).await;
    assert_eq!(reason, StopReason::Completed);

    assert_eq!(
        log.events(),
        vec![InputEvent::Click, InputEvent::Click]
    );
    finish(rig).await;
}
