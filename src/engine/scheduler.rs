//! The cooperative execution scheduler.
//!
//! One async loop owns the flowchart and all run state. Each tick evaluates
//! the current step (directly for pointer/logical steps, through the
//! detection service for image/color steps), interprets the outcome and
//! either re-arms a future tick, resolves a branch into a new current index,
//! or halts. Expensive image work never runs on this loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

use super::types::{EngineCommand, EngineEvent, EngineState, StopReason};
use crate::detect::{
    self, counting, Detection, DetectionService, Region, TemplateCache, DEFAULT_MERGE_RATIO,
};
use crate::detect::ocr::OcrEngine;
use crate::drivers::{InputDriver, RunFlag, ScreenCapture};
use crate::error::{DetectError, EngineError, EngineResult};
use crate::expr::Comparison;
use crate::graph::{
    ColorStep, CountCondition, FlowAction, Flowchart, ImageStep, InjectStep, InputAction,
    LogicalStep, MatchAction, Outcome, PointerStep, RunInfo, StepPayload, TextSource,
};
use crate::market::{shared_market, SharedMarket};
use crate::settings::{keys, SettingsRegistry};

/// Why the loop is waiting before doing more work.
#[derive(Debug, Clone, Copy)]
enum Pause {
    /// Re-evaluate the same step after the scan interval.
    Retick { until: Instant },
    /// Inter-step delay; arm the step at `current_index` when it elapses.
    Advance { until: Instant },
}

/// Cloneable control surface for a running engine.
///
/// `stop` is callable from any thread and is safe to call repeatedly and
/// concurrently: the first caller wins the guard flag and the teardown runs
/// once, on the scheduler task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    running: RunFlag,
    stop_requested: Arc<AtomicBool>,
}

impl EngineHandle {
    pub async fn start(&self, start_index: usize) -> bool {
        self.cmd_tx
            .send(EngineCommand::Start { start_index })
            .await
            .is_ok()
    }

    /// Halt the run. Returns whether this call initiated the teardown.
    ///
    /// Clears the shared running flag immediately so in-flight pointer moves
    /// and detection polls observe the stop; the actual teardown is deferred
    /// onto the scheduler task.
    pub fn stop(&self) -> bool {
        if self
            .stop_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.running.set(false);
        let _ = self.cmd_tx.try_send(EngineCommand::Stop);
        true
    }

    pub async fn shutdown(&self) -> bool {
        self.running.set(false);
        self.cmd_tx.send(EngineCommand::Shutdown).await.is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }
}

pub struct Engine {
    flow: Flowchart,
    capture: Box<dyn ScreenCapture>,
    input: Box<dyn InputDriver>,
    ocr: Option<Box<dyn OcrEngine>>,
    settings: SettingsRegistry,
    market: SharedMarket,
    templates: TemplateCache,
    detection: DetectionService,
    global_area: Region,
    state: EngineState,
    running: RunFlag,
    stop_requested: Arc<AtomicBool>,
    current_index: usize,
    step_started: Instant,
    pause: Option<Pause>,
    should_exit: bool,
    command_rx: mpsc::Receiver<EngineCommand>,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl Engine {
    pub fn new(
        flow: Flowchart,
        capture: Box<dyn ScreenCapture>,
        input: Box<dyn InputDriver>,
        global_area: Region,
        command_rx: mpsc::Receiver<EngineCommand>,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            flow,
            capture,
            input,
            ocr: None,
            settings: SettingsRegistry::with_defaults(),
            market: shared_market(),
            templates: TemplateCache::new(),
            detection: DetectionService::new(),
            global_area,
            state: EngineState::Idle,
            running: RunFlag::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            current_index: 0,
            step_started: Instant::now(),
            pause: None,
            should_exit: false,
            command_rx,
            event_tx,
        }
    }

    /// Attach an OCR engine; without one, number-reading steps miss every
    /// cycle instead of failing the run.
    pub fn with_ocr(mut self, ocr: Box<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_settings(mut self, settings: SettingsRegistry) -> Self {
        self.settings = settings;
        self
    }

    pub fn handle(&self, cmd_tx: mpsc::Sender<EngineCommand>) -> EngineHandle {
        EngineHandle {
            cmd_tx,
            running: self.running.clone(),
            stop_requested: Arc::clone(&self.stop_requested),
        }
    }

    pub fn market(&self) -> SharedMarket {
        Arc::clone(&self.market)
    }

    pub fn flowchart(&self) -> &Flowchart {
        &self.flow
    }

    pub fn flowchart_mut(&mut self) -> &mut Flowchart {
        &mut self.flow
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn settings(&self) -> &SettingsRegistry {
        &self.settings
    }

    /// Engine loop: drains commands, then advances the state machine.
    pub async fn run(&mut self) {
        debug!("Engine loop started");
        loop {
            while let Ok(command) = self.command_rx.try_recv() {
                self.process_command(command).await;
            }
            if self.should_exit {
                break;
            }

            if !matches!(self.state, EngineState::Running) {
                sleep(Duration::from_millis(50)).await;
                continue;
            }

            // A stop from another thread clears the flag first; teardown
            // happens here, on the scheduler task.
            if !self.running.is_running() {
                self.finalize_stop(StopReason::Requested, "Stopped".to_string())
                    .await;
                continue;
            }

            match self.pause {
                Some(Pause::Retick { until }) | Some(Pause::Advance { until })
                    if Instant::now() < until =>
                {
                    let nap = (until - Instant::now()).min(Duration::from_millis(50));
                    sleep(nap).await;
                    continue;
                }
                Some(Pause::Retick { .. }) => {
                    self.pause = None;
                }
                Some(Pause::Advance { .. }) => {
                    self.pause = None;
                    self.arm_current_step().await;
                    continue;
                }
                None => {}
            }

            if let Err(e) = self.tick().await {
                error!("Execution error: {e}");
                self.begin_stop(
                    StopReason::Error(e.to_string()),
                    format!("Stopped due to error: {e}"),
                )
                .await;
            }
        }
        debug!("Engine loop ended");
    }

    async fn process_command(&mut self, command: EngineCommand) {
        debug!("Processing engine command: {command:?}");
        match command {
            EngineCommand::Start { start_index } => self.handle_start(start_index).await,
            EngineCommand::Stop => {
                if matches!(self.state, EngineState::Running) {
                    let _ = self.stop_requested.compare_exchange(
                        false,
                        true,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    self.running.set(false);
                    // The loop top performs the teardown exactly once.
                } else {
                    self.stop_requested.store(false, Ordering::SeqCst);
                }
            }
            EngineCommand::Shutdown => {
                if matches!(self.state, EngineState::Running) {
                    self.running.set(false);
                    self.finalize_stop(StopReason::Requested, "Stopped".to_string())
                        .await;
                }
                self.should_exit = true;
                info!("Engine shutting down");
            }
        }
    }

    async fn handle_start(&mut self, start_index: usize) {
        if matches!(self.state, EngineState::Running) {
            debug!("Engine already running, ignoring start command");
            return;
        }
        if let Err(e) = self.flow.validate(start_index) {
            warn!("Cannot start: {e}");
            let _ = self
                .event_tx
                .send(EngineEvent::Error(format!("Cannot start: {e}")))
                .await;
            return;
        }

        self.warm_template_caches();
        self.reset_flagged_state();

        self.current_index = start_index;
        self.pause = None;
        self.detection.cancel();
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.set(true);
        self.state = EngineState::Running;
        self.step_started = Instant::now();

        info!("Automation started at step {}", start_index + 1);
        let _ = self
            .event_tx
            .send(EngineEvent::Started { start_index })
            .await;
        let name = self
            .flow
            .get(start_index)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let _ = self
            .event_tx
            .send(EngineEvent::StepStarted {
                index: start_index,
                name,
            })
            .await;
    }

    /// Load every image step's references up front so the first detection
    /// attempt of each step does not stall on disk.
    fn warm_template_caches(&mut self) {
        for step in self.flow.steps() {
            if let StepPayload::Image(image_step) = &step.payload
                && let Err(e) = self
                    .templates
                    .resolve(&image_step.source, image_step.color_mode)
            {
                warn!("Template pre-cache failed: {e}");
            }
        }
    }

    /// Clear transient state of logical steps flagged reset-on-start.
    fn reset_flagged_state(&mut self) {
        for step in self.flow.steps_mut() {
            if let StepPayload::Logical(logical) = &step.payload {
                match logical {
                    LogicalStep::Count(c) if c.reset_on_start => {
                        step.state.counter_value = 0;
                    }
                    LogicalStep::Wait(w) if w.reset_on_start => {
                        step.state.wait_started = None;
                        step.state.last_wait_secs = None;
                    }
                    LogicalStep::MotionCheck(m) if m.reset_on_start => {
                        step.state.baseline_frame = None;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Internal stop from flow control, completion or an error.
    async fn begin_stop(&mut self, reason: StopReason, message: String) {
        if self
            .stop_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // An external stop won the race; its teardown runs from the loop.
            return;
        }
        self.running.set(false);
        self.finalize_stop(reason, message).await;
    }

    async fn finalize_stop(&mut self, reason: StopReason, message: String) {
        self.detection.cancel();
        self.pause = None;
        self.running.set(false);
        self.state = EngineState::Stopped(reason.clone());
        info!("{message}");
        let _ = self
            .event_tx
            .send(EngineEvent::Stopped { reason, message })
            .await;
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    /// Begin the step at `current_index` after an inter-step delay; a run
    /// that walked past the last step is complete.
    async fn arm_current_step(&mut self) {
        self.detection.cancel();
        if self.current_index >= self.flow.len() {
            self.begin_stop(
                StopReason::Completed,
                "Completed all steps".to_string(),
            )
            .await;
            return;
        }
        self.step_started = Instant::now();
        let name = self
            .flow
            .get(self.current_index)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let _ = self
            .event_tx
            .send(EngineEvent::StepStarted {
                index: self.current_index,
                name,
            })
            .await;
    }

    async fn tick(&mut self) -> EngineResult<()> {
        let index = self.current_index;
        let Some(step) = self.flow.get(index) else {
            return Err(EngineError::IndexOutOfRange { index });
        };
        let name = step.name.clone();
        let payload = step.payload.clone();
        let timeout_spec = step.timeout_spec();

        let _ = self
            .event_tx
            .send(EngineEvent::Status(format!(
                "Running step {}: {}",
                index + 1,
                name
            )))
            .await;

        if let Some((timeout_secs, _)) = timeout_spec
            && timeout_secs > 0.0
            && self.step_started.elapsed().as_secs_f64() > timeout_secs
        {
            return self.fail_step(index).await;
        }

        match payload {
            StepPayload::Color(color_step) => self.tick_color(index, color_step).await,
            StepPayload::Image(image_step) => self.tick_image(index, image_step).await,
            StepPayload::Pointer(pointer_step) => self.tick_pointer(index, pointer_step).await,
            StepPayload::Logical(logical) => self.tick_logical(index, logical).await,
        }
    }

    // ----- outcome handling ------------------------------------------------

    async fn record_outcome(&mut self, index: usize, outcome: Outcome, detail: String) {
        if let Some(step) = self.flow.get_mut(index) {
            step.state.last_run = Some(RunInfo {
                outcome,
                detail: detail.clone(),
            });
        }
        let _ = self
            .event_tx
            .send(EngineEvent::StepOutcome {
                index,
                outcome,
                detail,
            })
            .await;
    }

    /// Success path: record, perform the step's input action (re-checking the
    /// running flag after any interruptible move), then resolve `on_success`.
    async fn succeed(
        &mut self,
        index: usize,
        action: Option<(InputAction, Option<(i32, i32)>)>,
        detail: String,
    ) -> EngineResult<()> {
        info!("Step {}: {detail}", index + 1);
        self.record_outcome(index, Outcome::Success, detail).await;

        if let Some((input_action, pos)) = action {
            self.perform_input(&input_action, pos)?;
        }

        let (on_success, delay_secs) = {
            let step = self
                .flow
                .get(index)
                .ok_or(EngineError::IndexOutOfRange { index })?;
            (step.on_success, step.delay_after_secs)
        };
        self.resolve_flow(index, on_success, delay_secs).await;
        Ok(())
    }

    /// Route a branch descriptor: `Next`/`Goto` update the index and start
    /// the delay countdown, `Stop` halts the run.
    async fn resolve_flow(&mut self, index: usize, action: FlowAction, delay_secs: f64) {
        match action {
            FlowAction::Stop => {
                self.begin_stop(
                    StopReason::FlowStop { step: index },
                    format!("Stopped by flow control at step {}", index + 1),
                )
                .await;
            }
            action => {
                if let Some(next) = action.resolve(index) {
                    self.current_index = next;
                }
                let delay = Duration::from_secs_f64(delay_secs.max(0.0));
                self.pause = Some(Pause::Advance {
                    until: Instant::now() + delay,
                });
            }
        }
    }

    /// Timeout or count/number failure: take the fail branch with no success
    /// action and no inter-step delay.
    async fn fail_step(&mut self, index: usize) -> EngineResult<()> {
        let Some(step) = self.flow.get(index) else {
            return Err(EngineError::IndexOutOfRange { index });
        };
        let (timeout_secs, on_timeout) = step.timeout_spec().unwrap_or((0.0, FlowAction::Stop));

        // Count-mode and number-read exhaustion is a failure, not a timeout.
        let failed = matches!(
            &step.payload,
            StepPayload::Color(ColorStep {
                on_match: MatchAction::Count(_),
                ..
            }) | StepPayload::Image(ImageStep {
                on_match: MatchAction::Count(_),
                ..
            }) | StepPayload::Logical(LogicalStep::NumberRead(_))
        );
        let (outcome, detail) = if failed {
            (Outcome::Failed, format!("Step {} failed", index + 1))
        } else {
            (
                Outcome::TimedOut,
                format!("Step {} timed out after {timeout_secs}s", index + 1),
            )
        };
        warn!("{detail}");
        self.record_outcome(index, outcome, detail).await;

        match on_timeout {
            FlowAction::Stop => {
                self.begin_stop(
                    StopReason::TimeoutStop { step: index },
                    format!("Stopped on timeout at step {}", index + 1),
                )
                .await;
            }
            action => {
                if let Some(next) = action.resolve(index) {
                    self.current_index = next;
                }
                self.pause = Some(Pause::Advance {
                    until: Instant::now(),
                });
            }
        }
        Ok(())
    }

    /// Re-evaluate the same step after the scan interval.
    fn retick(&mut self) {
        let interval = self
            .settings
            .f64(keys::SCAN_INTERVAL)
            .unwrap_or(0.25)
            .max(0.0);
        self.pause = Some(Pause::Retick {
            until: Instant::now() + Duration::from_secs_f64(interval),
        });
    }

    async fn detection_status(&mut self, text: String) {
        let _ = self.event_tx.send(EngineEvent::Detection(text)).await;
    }

    // ----- input -----------------------------------------------------------

    fn perform_input(
        &mut self,
        action: &InputAction,
        pos: Option<(i32, i32)>,
    ) -> EngineResult<()> {
        let speed = Duration::from_secs_f64(
            self.settings
                .f64(keys::MOUSE_SPEED)
                .unwrap_or(0.25)
                .max(0.0),
        );
        match action {
            InputAction::LeftClick => {
                let Some((x, y)) = pos else {
                    warn!("No target position for click, skipping");
                    return Ok(());
                };
                self.input.move_to(x, y, speed, &self.running)?;
                // A stop mid-move must not still commit the click.
                if !self.running.is_running() {
                    return Ok(());
                }
                self.input.click()?;
            }
            InputAction::RightClick => {
                let Some((x, y)) = pos else {
                    warn!("No target position for right click, skipping");
                    return Ok(());
                };
                self.input.move_to(x, y, speed, &self.running)?;
                if !self.running.is_running() {
                    return Ok(());
                }
                self.input.right_click()?;
            }
            InputAction::MoveOnly => {
                let Some((x, y)) = pos else {
                    warn!("No target position for move, skipping");
                    return Ok(());
                };
                self.input.move_to(x, y, speed, &self.running)?;
            }
            InputAction::ClickOnly => {
                if !self.running.is_running() {
                    return Ok(());
                }
                self.input.click()?;
            }
            InputAction::KeyPress(key) => {
                self.input.press(key)?;
            }
        }
        Ok(())
    }

    // ----- capture helpers -------------------------------------------------

    fn area_or_global(&self, area: Option<Region>) -> Region {
        area.unwrap_or(self.global_area)
    }

    /// Capture faults are a miss for the tick, retried next cycle.
    fn capture_region(&mut self, region: Region) -> Option<image::RgbImage> {
        match self.capture.capture(region) {
            Ok(img) => Some(img),
            Err(e) => {
                warn!("Screen capture failed, retrying next cycle: {e}");
                None
            }
        }
    }

    // ----- step dispatch ---------------------------------------------------

    async fn tick_color(&mut self, index: usize, step: ColorStep) -> EngineResult<()> {
        match step.on_match.clone() {
            MatchAction::Count(condition) => {
                let region = self.area_or_global(step.area);
                if region.is_empty() {
                    warn!("Step {}: invalid area for color count", index + 1);
                    return self.fail_step(index).await;
                }
                let Some(screen) = self.capture_region(region) else {
                    self.retick();
                    return Ok(());
                };
                let count = detect::color::count_blobs(&screen, &step.color, step.min_area);
                self.evaluate_count(
                    index,
                    count,
                    condition,
                    format!("Found {count} color blob(s)"),
                )
                .await
            }
            MatchAction::Input(action) => {
                if self.detection.busy() {
                    self.retick();
                    return Ok(());
                }

                if let Some(Detection::Color {
                    pos: Some(pos),
                    area,
                }) = self.detection.poll()
                {
                    self.detection_status(format!("Color found: area {area:.0}px"))
                        .await;
                    let detail = format!("Color found at {pos:?} with area {area:.0}px");
                    return self
                        .succeed(
                            index,
                            Some((action, Some((pos.0 as i32, pos.1 as i32)))),
                            detail,
                        )
                        .await;
                }

                if let Some((px, py)) = step.pixel_probe {
                    // A single fixed-coordinate sample; no contour pass.
                    match self.capture.pixel(px, py) {
                        Ok(rgb) if detect::color::pixel_matches(&step.color, rgb) => {
                            let detail = format!("Pixel color found at ({px}, {py})");
                            return self
                                .succeed(
                                    index,
                                    Some((action, Some((px as i32, py as i32)))),
                                    detail,
                                )
                                .await;
                        }
                        Ok(_) => {
                            self.detection_status(format!(
                                "Color: probing pixel ({px}, {py}) for RGB {:?}",
                                step.color.rgb
                            ))
                            .await;
                        }
                        Err(e) => warn!("Pixel probe failed, retrying next cycle: {e}"),
                    }
                    self.retick();
                    return Ok(());
                }

                let region = self.area_or_global(step.area);
                if region.is_empty() {
                    self.retick();
                    return Ok(());
                }
                let Some(screen) = self.capture_region(region) else {
                    self.retick();
                    return Ok(());
                };
                self.detection_status(format!(
                    "Color: searching for RGB {:?} (tolerance {})",
                    step.color.rgb, step.color.tolerance
                ))
                .await;

                let spec = step.color;
                let min_area = step.min_area;
                let offset = region.offset();
                self.detection.start(move || {
                    match detect::color::find_largest_blob(&screen, offset, &spec, min_area) {
                        Some(blob) => Detection::Color {
                            pos: Some(blob.pos),
                            area: blob.area,
                        },
                        None => Detection::Color {
                            pos: None,
                            area: 0.0,
                        },
                    }
                });
                self.retick();
                Ok(())
            }
        }
    }

    async fn tick_image(&mut self, index: usize, step: ImageStep) -> EngineResult<()> {
        match step.on_match.clone() {
            MatchAction::Count(condition) => {
                let region = self.area_or_global(step.area);
                if region.is_empty() {
                    warn!("Step {}: invalid area for template count", index + 1);
                    return self.fail_step(index).await;
                }
                let Some(screen) = self.capture_region(region) else {
                    self.retick();
                    return Ok(());
                };
                // Unreadable references just contribute zero matches.
                let templates = match self.templates.resolve(&step.source, step.color_mode) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Step {}: {e}", index + 1);
                        Arc::new(Vec::new())
                    }
                };
                let processed = detect::template::preprocess_screen(&screen, step.color_mode);
                let count = counting::count_template_matches(
                    &processed,
                    &templates,
                    step.threshold,
                    DEFAULT_MERGE_RATIO,
                );
                self.evaluate_count(
                    index,
                    count,
                    condition,
                    format!("Found {count} template instance(s)"),
                )
                .await
            }
            MatchAction::Input(action) => {
                if self.detection.busy() {
                    self.retick();
                    return Ok(());
                }

                if let Some(Detection::Template {
                    pos: Some(pos),
                    confidence,
                }) = self.detection.poll()
                {
                    self.detection_status(format!(
                        "Template found: {:.1}%",
                        confidence * 100.0
                    ))
                    .await;
                    let detail = format!(
                        "Template found at {pos:?} with {:.1}% confidence",
                        confidence * 100.0
                    );
                    return self
                        .succeed(
                            index,
                            Some((action, Some((pos.0 as i32, pos.1 as i32)))),
                            detail,
                        )
                        .await;
                }

                let region = self.area_or_global(step.area);
                if region.is_empty() {
                    self.retick();
                    return Ok(());
                }
                let Some(screen) = self.capture_region(region) else {
                    self.retick();
                    return Ok(());
                };
                let templates = match self.templates.resolve(&step.source, step.color_mode) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Step {}: {e}", index + 1);
                        self.retick();
                        return Ok(());
                    }
                };
                self.detection_status(format!(
                    "Template: searching {:?} (threshold {})",
                    step.source.path(),
                    step.threshold
                ))
                .await;

                let mode = step.color_mode;
                let threshold = step.threshold;
                let first_match_only = step.first_match_only;
                let offset = region.offset();
                self.detection.start(move || {
                    let processed = detect::template::preprocess_screen(&screen, mode);
                    match detect::matcher::find_in_region(
                        &processed,
                        offset,
                        &templates,
                        threshold,
                        first_match_only,
                    ) {
                        Some(found) => Detection::Template {
                            pos: Some(found.pos),
                            confidence: found.confidence,
                        },
                        None => Detection::Template {
                            pos: None,
                            confidence: 0.0,
                        },
                    }
                });
                self.retick();
                Ok(())
            }
        }
    }

    async fn tick_pointer(&mut self, index: usize, step: PointerStep) -> EngineResult<()> {
        let detail = match &step.action {
            InputAction::KeyPress(key) => format!("Pressed key '{key}'"),
            other => format!("Performed {other:?} at {:?}", step.coords),
        };
        self.succeed(index, Some((step.action, Some(step.coords))), detail)
            .await
    }

    /// Expression-over-count evaluation shared by the count-mode color and
    /// image paths, tracking the consecutive-miss cycle allowance.
    async fn evaluate_count(
        &mut self,
        index: usize,
        count: usize,
        condition: CountCondition,
        found_detail: String,
    ) -> EngineResult<()> {
        self.detection_status(format!(
            "{found_detail}. Condition: {}",
            condition.expression
        ))
        .await;

        let comparison = match Comparison::parse(&condition.expression) {
            Ok(c) => c,
            Err(e) => {
                warn!("Step {}: {e}", index + 1);
                if let Some(step) = self.flow.get_mut(index) {
                    step.state.miss_cycles = 0;
                }
                return self.fail_step(index).await;
            }
        };

        if comparison.evaluate(count as f64) {
            if let Some(step) = self.flow.get_mut(index) {
                step.state.miss_cycles = 0;
            }
            let detail = format!(
                "{found_detail}; condition '{}' is true",
                condition.expression
            );
            self.succeed(index, None, detail).await
        } else {
            let miss_cycles = match self.flow.get_mut(index) {
                Some(step) => {
                    step.state.miss_cycles += 1;
                    step.state.miss_cycles
                }
                None => return Err(EngineError::IndexOutOfRange { index }),
            };
            self.record_outcome(
                index,
                Outcome::Failed,
                format!(
                    "{found_detail}; condition '{}' is false (cycle {miss_cycles}/{})",
                    condition.expression, condition.max_cycles
                ),
            )
            .await;

            if miss_cycles >= condition.max_cycles {
                warn!(
                    "Step {}: count condition failed after {} cycle(s)",
                    index + 1,
                    condition.max_cycles
                );
                if let Some(step) = self.flow.get_mut(index) {
                    step.state.miss_cycles = 0;
                }
                self.fail_step(index).await
            } else {
                self.retick();
                Ok(())
            }
        }
    }

    async fn tick_logical(&mut self, index: usize, logical: LogicalStep) -> EngineResult<()> {
        match logical {
            LogicalStep::Count(count_step) => {
                let (counter, max_count) = match self.flow.get_mut(index) {
                    Some(step) => {
                        step.state.counter_value += 1;
                        (step.state.counter_value, count_step.max_count)
                    }
                    None => return Err(EngineError::IndexOutOfRange { index }),
                };
                let cap = if max_count > 0 {
                    max_count.to_string()
                } else {
                    "∞".to_string()
                };
                self.detection_status(format!("Count: {counter}/{cap}")).await;
                info!("Step {}: count is now {counter}/{cap}", index + 1);

                if max_count > 0 && counter >= max_count {
                    self.record_outcome(
                        index,
                        Outcome::CountReached,
                        format!("Counter reached the limit of {max_count}"),
                    )
                    .await;
                    self.resolve_flow(
                        index,
                        count_step.on_count_reached,
                        count_step.count_reached_delay_secs,
                    )
                    .await;
                    if count_step.reset_on_reach
                        && let Some(step) = self.flow.get_mut(index)
                    {
                        step.state.counter_value = 0;
                    }
                    Ok(())
                } else {
                    self.succeed(index, None, format!("Counter incremented to {counter}"))
                        .await
                }
            }

            LogicalStep::Wait(wait_step) => {
                let started = match self.flow.get_mut(index) {
                    Some(step) => *step
                        .state
                        .wait_started
                        .get_or_insert_with(std::time::Instant::now),
                    None => return Err(EngineError::IndexOutOfRange { index }),
                };
                let elapsed = started.elapsed().as_secs_f64();
                self.detection_status(format!(
                    "Wait: {elapsed:.1}s / {:.1}s",
                    wait_step.duration_secs
                ))
                .await;

                if elapsed >= wait_step.duration_secs {
                    if let Some(step) = self.flow.get_mut(index) {
                        step.state.wait_started = None;
                        step.state.last_wait_secs = Some(elapsed);
                    }
                    self.succeed(index, None, format!("Waited for {elapsed:.2}s"))
                        .await
                } else {
                    self.record_outcome(index, Outcome::Waiting, format!("Elapsed: {elapsed:.1}s"))
                        .await;
                    self.retick();
                    Ok(())
                }
            }

            LogicalStep::TypeText(type_text) => {
                let (text, source_desc) = match &type_text.source {
                    TextSource::Static(text) => (text.clone(), "static text".to_string()),
                    TextSource::Market(field) => {
                        let value = self.market.lock().unwrap().field_text(*field);
                        match value {
                            Some(v) => (v, format!("market {field:?}")),
                            None => {
                                warn!(
                                    "Step {}: no market data available to type",
                                    index + 1
                                );
                                (String::new(), format!("market {field:?}"))
                            }
                        }
                    }
                };
                let to_type = text.replace(',', "");
                self.detection_status(format!("Typing '{to_type}'")).await;
                self.input.write(&to_type)?;
                if type_text.press_enter {
                    sleep(Duration::from_secs_f64(
                        type_text.enter_delay_secs.max(0.0),
                    ))
                    .await;
                    self.input.press("enter")?;
                }
                self.succeed(
                    index,
                    None,
                    format!("Typed '{to_type}' from {source_desc}"),
                )
                .await
            }

            LogicalStep::Inject(inject) => match inject {
                InjectStep::Item { name, refresh } => {
                    self.market.lock().unwrap().item_name = name.clone();
                    if refresh {
                        let _ = self.event_tx.send(EngineEvent::MarketRefreshRequested).await;
                    }
                    self.succeed(index, None, format!("Injected item name '{name}'"))
                        .await
                }
                InjectStep::Quantity { value, refresh } => {
                    self.market.lock().unwrap().quantity = value.clone();
                    if refresh {
                        let _ = self.event_tx.send(EngineEvent::MarketRefreshRequested).await;
                    }
                    self.succeed(index, None, format!("Injected quantity '{value}'"))
                        .await
                }
                InjectStep::Setting { name, value } => {
                    match self.settings.set_from_str(&name, &value) {
                        Ok(new_value) => {
                            self.succeed(
                                index,
                                None,
                                format!("Injected setting '{name}' = {new_value:?}"),
                            )
                            .await
                        }
                        Err(e) => {
                            // A no-op failure: logged, no fail branch.
                            warn!("Step {}: {e}", index + 1);
                            self.record_outcome(index, Outcome::Failed, e.to_string())
                                .await;
                            self.retick();
                            Ok(())
                        }
                    }
                }
            },

            LogicalStep::NumberRead(number_read) => {
                let region = self.area_or_global(number_read.area);
                if region.is_empty() {
                    self.retick();
                    return Ok(());
                }
                let comparison = match Comparison::parse(&number_read.expression) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Step {}: {e}", index + 1);
                        return self.fail_step(index).await;
                    }
                };
                if self.ocr.is_none() {
                    self.detection_status("OCR engine unavailable".to_string())
                        .await;
                    self.retick();
                    return Ok(());
                }
                let Some(screen) = self.capture_region(region) else {
                    self.retick();
                    return Ok(());
                };

                let read = match self.ocr.as_mut() {
                    Some(ocr) => detect::ocr::read_number(
                        ocr.as_mut(),
                        &screen,
                        number_read.preprocess,
                        &number_read.ocr,
                    ),
                    None => Err(DetectError::OcrUnavailable),
                };
                match read {
                    Ok(read) => {
                        let matched = comparison.evaluate(read.value);
                        self.detection_status(format!(
                            "OCR read {}; condition met: {matched}",
                            read.value
                        ))
                        .await;
                        if matched {
                            self.succeed(
                                index,
                                None,
                                format!(
                                    "OCR read {} satisfied '{}'",
                                    read.value, number_read.expression
                                ),
                            )
                            .await
                        } else {
                            self.record_outcome(
                                index,
                                Outcome::Failed,
                                format!(
                                    "OCR read {} did not satisfy '{}'",
                                    read.value, number_read.expression
                                ),
                            )
                            .await;
                            self.retick();
                            Ok(())
                        }
                    }
                    Err(e) => {
                        // A failed read dwells like any other miss.
                        debug!("Step {}: OCR miss: {e}", index + 1);
                        self.detection_status(format!("OCR: {e}")).await;
                        self.retick();
                        Ok(())
                    }
                }
            }

            LogicalStep::MotionCheck(motion_check) => {
                let region = self.area_or_global(motion_check.area);
                if region.is_empty() {
                    warn!("Step {}: invalid area for motion check", index + 1);
                    return self.fail_step(index).await;
                }
                let Some(screen) = self.capture_region(region) else {
                    self.retick();
                    return Ok(());
                };
                let current = DynamicImage::ImageRgb8(screen).to_luma8();

                let baseline = match self.flow.get_mut(index) {
                    Some(step) => step.state.baseline_frame.take(),
                    None => return Err(EngineError::IndexOutOfRange { index }),
                };

                let Some(previous) = baseline else {
                    if let Some(step) = self.flow.get_mut(index) {
                        step.state.baseline_frame = Some(current);
                    }
                    self.record_outcome(
                        index,
                        Outcome::Waiting,
                        "First frame captured".to_string(),
                    )
                    .await;
                    self.detection_status(
                        "Motion: first frame captured, waiting for second".to_string(),
                    )
                    .await;
                    self.retick();
                    return Ok(());
                };

                match detect::motion::is_still(&previous, &current, motion_check.tolerance_pct) {
                    // The baseline stays cleared either way: every comparison
                    // is a fresh two-frame window.
                    Ok((still, change)) => {
                        self.detection_status(format!(
                            "Motion: {change:.2}% changed (tolerance {}%)",
                            motion_check.tolerance_pct
                        ))
                        .await;
                        if still {
                            self.succeed(
                                index,
                                None,
                                format!("Stillness detected, change {change:.2}%"),
                            )
                            .await
                        } else {
                            self.record_outcome(
                                index,
                                Outcome::Waiting,
                                format!("Movement ongoing, change {change:.2}%"),
                            )
                            .await;
                            self.retick();
                            Ok(())
                        }
                    }
                    Err(e) => {
                        warn!("Step {}: {e}; resetting comparison", index + 1);
                        if let Some(step) = self.flow.get_mut(index) {
                            step.state.baseline_frame = Some(current);
                        }
                        self.retick();
                        Ok(())
                    }
                }
            }
        }
    }
}
