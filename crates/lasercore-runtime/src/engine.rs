//! [`ProtocolEngine`] – runs an admitted protocol line by line against the
//! [`DeviceSet`].
//!
//! # Run lifecycle
//!
//! ```text
//! start ─▶ admit (validate + Armed) ─▶ Armed → Treating ─▶ arm emission
//!   └─▶ for each loop iteration, for each line:
//!         pre-line permission check
//!         dispatch every enabled action concurrently
//!         wait for all of them, for a stop, or for loss of permission
//!   └─▶ selective shutdown ─▶ Treating → Armed (when still Treating)
//! ```
//!
//! Lines never overlap and a line finishes when its slowest action does.
//! A critical action failing cancels its siblings and faults the run; a
//! non-critical one is tolerated only when
//! [`EngineConfig::tolerate_non_critical_failures`] is set.
//!
//! Controller calls block on serial I/O and run on the blocking pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use lasercore_hal::DeviceSet;
use lasercore_kernel::TreatmentGate;
use lasercore_middleware::Notifier;
use lasercore_protocol::timing::seconds;
use lasercore_protocol::{
    LineBasedProtocol, LineTiming, MotionOrigin, MoveMode, ProtocolAction, ProtocolLine,
    RampCurve, ValidatedProtocol,
};
use lasercore_types::{
    AbortReason, ActionKind, DeviceKind, EngineConfig, EventPayload, ExecutionContext,
    ExecutionError, ExecutionEvent, ExecutionState, HardwareError, RunOutcome, SafetySnapshot,
    SafetyState,
};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::retry::{Exhausted, RetryPolicy};

const SOURCE: &str = "lasercore-runtime::engine";

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

/// A non-critical action that failed without ending the run.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFailure {
    pub iteration: u32,
    pub line: usize,
    pub action: ActionKind,
    pub error: ExecutionError,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
    pub lines_completed: usize,
    /// Retries spent over the whole run.
    pub retries: u32,
    /// The error that faulted the run, if one did.
    pub error: Option<ExecutionError>,
    pub tolerated: Vec<ActionFailure>,
}

impl RunReport {
    pub fn state(&self) -> ExecutionState {
        self.outcome.state()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ProtocolEngine
// ────────────────────────────────────────────────────────────────────────────

pub struct ProtocolEngine {
    devices: Arc<DeviceSet>,
    gate: Arc<TreatmentGate>,
    notifier: Notifier,
    config: Arc<EngineConfig>,
    busy: Arc<AtomicBool>,
}

/// Clears the engine's busy flag when the run (or a failed start) ends.
struct BusyFlag(Arc<AtomicBool>);

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ProtocolEngine {
    pub fn new(
        devices: Arc<DeviceSet>,
        gate: Arc<TreatmentGate>,
        notifier: Notifier,
        config: EngineConfig,
    ) -> Self {
        Self {
            devices,
            gate,
            notifier,
            config: Arc::new(config),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn gate(&self) -> &Arc<TreatmentGate> {
        &self.gate
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Admit `protocol`, move to `Treating` and spawn the run.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, protocol: LineBasedProtocol) -> Result<RunHandle, ExecutionError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::AlreadyRunning);
        }
        let busy = BusyFlag(Arc::clone(&self.busy));

        let validated = self.gate.admit(protocol)?;
        self.gate.begin()?;

        let run_id = Uuid::new_v4();
        let origin = MotionOrigin {
            position_mm: self.devices.actuator().position(),
            home_speed_mm_s: self.config.home_speed_mm_s,
        };
        let mut ctx = ExecutionContext::new(run_id, validated.lines.len(), validated.loop_count);
        ctx.state = ExecutionState::Running;
        ctx.permission_snapshot = true;

        let (progress_tx, progress_rx) = watch::channel(ctx.clone());
        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let span = info_span!("run", %run_id, protocol = validated.name());
        let run = Run {
            id: run_id,
            origin,
            timeline: Vec::new(),
            protocol: validated,
            env: ActionEnv {
                devices: Arc::clone(&self.devices),
                config: Arc::clone(&self.config),
                retry: RetryPolicy::from_config(&self.config),
                pacer: Pacer(pause_rx.clone()),
            },
            gate: Arc::clone(&self.gate),
            notifier: self.notifier.clone(),
            cancel: cancel.clone(),
            pause: pause_rx,
            permission: self.gate.monitor().subscribe(),
            ctx,
            progress: progress_tx,
            started: Instant::now(),
            lines_completed: 0,
            retries: 0,
            error: None,
            tolerated: Vec::new(),
        };

        let task = tokio::spawn(
            async move {
                let _busy = busy;
                run.execute().await
            }
            .instrument(span),
        );

        Ok(RunHandle {
            run_id,
            cancel,
            pause: pause_tx,
            progress: progress_rx,
            task,
        })
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RunHandle
// ────────────────────────────────────────────────────────────────────────────

/// Control over one active run. Dropping the handle leaves the run going.
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    progress: watch::Receiver<ExecutionContext>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Hold before the next line; timed actions in flight stop counting.
    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    /// Abort the run. Laser output is removed before the run reports.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn progress(&self) -> watch::Receiver<ExecutionContext> {
        self.progress.clone()
    }

    pub fn context(&self) -> ExecutionContext {
        self.progress.borrow().clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.progress.borrow().state
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> RunReport {
        let last = self.progress.borrow().clone();
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "run task ended abnormally");
                RunReport {
                    run_id: self.run_id,
                    outcome: RunOutcome::Faulted {
                        error: format!("run task failed: {e}"),
                    },
                    elapsed: last.elapsed,
                    lines_completed: 0,
                    retries: last.total_retries(),
                    error: None,
                    tolerated: Vec::new(),
                }
            }
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Run task
// ────────────────────────────────────────────────────────────────────────────

struct Run {
    id: Uuid,
    protocol: ValidatedProtocol,
    origin: MotionOrigin,
    /// Expected line timings of the current iteration.
    timeline: Vec<LineTiming>,
    env: ActionEnv,
    gate: Arc<TreatmentGate>,
    notifier: Notifier,
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
    permission: watch::Receiver<SafetySnapshot>,
    ctx: ExecutionContext,
    progress: watch::Sender<ExecutionContext>,
    started: Instant,
    lines_completed: usize,
    retries: u32,
    error: Option<ExecutionError>,
    tolerated: Vec<ActionFailure>,
}

/// Resolves once the monitor stops permitting treatment.
async fn permission_lost(rx: &mut watch::Receiver<SafetySnapshot>) -> SafetyState {
    match rx.wait_for(|s| !s.treatment_permitted()).await {
        Ok(snapshot) => snapshot.state,
        // Monitor gone: nothing can vouch for the interlocks any more.
        Err(_) => SafetyState::Unsafe,
    }
}

impl Run {
    async fn execute(mut self) -> RunReport {
        info!(
            lines = self.protocol.lines.len(),
            loops = self.protocol.loop_count,
            estimated_s = self.protocol.estimated_duration().as_secs_f64(),
            "run started"
        );
        self.record(ExecutionEvent::RunStarted {
            run_id: self.id,
            protocol: self.protocol.name().to_owned(),
            line_count: self.protocol.lines.len(),
            loop_count: self.protocol.loop_count,
            estimated_s: self.protocol.estimated_duration().as_secs_f64(),
        });
        self.publish_progress();

        let outcome = self.drive().await;
        self.finish(outcome).await
    }

    async fn drive(&mut self) -> RunOutcome {
        let mut arming = 0;
        let armed = self
            .env
            .retried(DeviceKind::Laser, &mut arming, |d| d.arm_emission())
            .await;
        self.retries += arming;
        if let Err(e) = armed {
            error!(error = %e.error, attempts = e.attempts, "could not arm emission");
            return RunOutcome::Faulted {
                error: format!("arming emission failed: {}", e.error),
            };
        }

        let protocol = self.protocol.clone();
        for iteration in 0..protocol.loop_count {
            self.timeline = protocol.iteration_timeline(iteration, self.origin);
            for (index, line) in protocol.lines.iter().enumerate() {
                if let Some(outcome) = self.between_lines().await {
                    return outcome;
                }
                if let Err(ExecutionError::NotPermitted { state }) = self.gate.check_line() {
                    warn!(iteration, line = index, %state, "permission gone before line");
                    return RunOutcome::Aborted {
                        reason: AbortReason::PermissionLost { state },
                    };
                }
                if let Err(outcome) = self.line(iteration, index, line).await {
                    return outcome;
                }
            }
        }
        RunOutcome::Completed
    }

    /// Honour a stop or a pause requested since the last line.
    async fn between_lines(&mut self) -> Option<RunOutcome> {
        if self.cancel.is_cancelled() {
            return Some(RunOutcome::Aborted {
                reason: AbortReason::OperatorStop,
            });
        }
        if !*self.pause.borrow() {
            return None;
        }

        self.publish_state(ExecutionState::Paused);
        let cancel = self.cancel.clone();
        let mut permission = self.permission.clone();
        let mut pause = self.pause.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Some(RunOutcome::Aborted { reason: AbortReason::OperatorStop });
            }
            state = permission_lost(&mut permission) => {
                return Some(RunOutcome::Aborted { reason: AbortReason::PermissionLost { state } });
            }
            _ = pause.wait_for(|paused| !*paused) => {}
        }
        self.publish_state(ExecutionState::Running);
        None
    }

    async fn line(
        &mut self,
        iteration: u32,
        index: usize,
        line: &ProtocolLine,
    ) -> Result<(), RunOutcome> {
        let expected = self.timeline.get(index).map(|t| t.duration).unwrap_or_default();

        self.ctx.loop_iteration = iteration;
        self.ctx.line_index = index;
        self.ctx.retry_counters.clear();
        self.ctx.permission_snapshot = true;
        self.publish_progress();
        self.record(ExecutionEvent::LineStarted {
            run_id: self.id,
            iteration,
            line: index,
            expected_s: expected.as_secs_f64(),
        });
        debug!(iteration, line = index, expected_s = expected.as_secs_f64(), "line started");

        let began = Instant::now();
        let cancel = self.cancel.clone();
        let mut permission = self.permission.clone();
        let actions = cancel.child_token();
        let span = info_span!("line", iteration, line = index);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunOutcome::Aborted { reason: AbortReason::OperatorStop }),
            state = permission_lost(&mut permission) => {
                Err(RunOutcome::Aborted { reason: AbortReason::PermissionLost { state } })
            }
            dispatched = self.dispatch(iteration, index, line, actions.clone()).instrument(span) => {
                dispatched.map_err(|error| RunOutcome::Faulted { error })
            }
        };
        actions.cancel();
        self.ctx.permission_snapshot = self.gate.monitor().snapshot().treatment_permitted();

        match &result {
            Ok(()) => {
                self.lines_completed += 1;
                self.record(ExecutionEvent::LineCompleted {
                    run_id: self.id,
                    iteration,
                    line: index,
                    elapsed_s: began.elapsed().as_secs_f64(),
                });
            }
            Err(outcome) => {
                let error = match outcome {
                    RunOutcome::Faulted { error } => error.clone(),
                    RunOutcome::Aborted { reason } => format!("aborted: {reason:?}"),
                    RunOutcome::Completed => String::new(),
                };
                self.record(ExecutionEvent::LineFailed {
                    run_id: self.id,
                    iteration,
                    line: index,
                    error,
                });
            }
        }
        self.publish_progress();
        result
    }

    /// Run every enabled action of `line` concurrently and wait for all of
    /// them. The first critical failure cancels the rest.
    async fn dispatch(
        &mut self,
        iteration: u32,
        index: usize,
        line: &ProtocolLine,
        token: CancellationToken,
    ) -> Result<(), String> {
        let mut set = JoinSet::new();
        for action in line.enabled_actions().cloned() {
            let env = self.env.clone();
            let token = token.clone();
            set.spawn(async move {
                let kind = action.kind();
                let mut retries = 0;
                let outcome = tokio::select! {
                    _ = token.cancelled() => None,
                    r = env.perform(index, &action, &mut retries) => Some(r),
                };
                (kind, retries, outcome)
            });
        }

        let mut failed: Option<String> = None;
        let mut pause = self.pause.clone();
        let mut pause_open = true;
        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((kind, retries, outcome)) => {
                            if retries > 0 {
                                self.retries += retries;
                                self.ctx.retry_counters.insert(kind, retries);
                                self.publish_progress();
                            }
                            if let Some(Err(error)) = outcome {
                                self.action_failed(iteration, index, kind, error, &mut failed, &token);
                            }
                        }
                        Err(join) => {
                            error!(line = index, error = %join, "action task failed");
                            if failed.is_none() {
                                token.cancel();
                                failed = Some(format!("line {index} action task failed: {join}"));
                            }
                        }
                    }
                }
                changed = pause.changed(), if pause_open => {
                    if changed.is_err() {
                        pause_open = false;
                        continue;
                    }
                    let paused = *pause.borrow_and_update();
                    self.publish_state(if paused {
                        ExecutionState::Paused
                    } else {
                        ExecutionState::Running
                    });
                }
            }
        }

        match failed {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }

    fn action_failed(
        &mut self,
        iteration: u32,
        index: usize,
        kind: ActionKind,
        error: ExecutionError,
        failed: &mut Option<String>,
        token: &CancellationToken,
    ) {
        if kind.is_critical() || !self.env.config.tolerate_non_critical_failures {
            error!(line = index, action = %kind, error = %error, "action failed");
            if failed.is_none() {
                token.cancel();
                *failed = Some(error.to_string());
                self.error = Some(error);
            }
            return;
        }
        warn!(line = index, action = %kind, error = %error, "non-critical action failed, continuing");
        self.record(ExecutionEvent::ActionFailed {
            run_id: self.id,
            iteration,
            line: index,
            action: kind,
            error: error.to_string(),
        });
        self.tolerated.push(ActionFailure {
            iteration,
            line: index,
            action: kind,
            error,
        });
    }

    /// Remove laser output, stop any motion left by an abort and hand the
    /// safety state back.
    async fn finish(mut self, outcome: RunOutcome) -> RunReport {
        if outcome != RunOutcome::Completed && self.env.devices.actuator().state().moving {
            if let Err(e) = self.env.call(DeviceKind::Actuator, |d| d.actuator().halt()).await {
                self.fault(format!("actuator halt after abort failed: {e}"));
            }
        }
        if let Err(e) = self.env.call(DeviceKind::Laser, |d| d.selective_shutdown()).await {
            self.fault(format!("selective shutdown after run failed: {e}"));
        }
        if let Err(e) = self.gate.end() {
            self.fault(format!("handing back the safety state failed: {e}"));
        }

        let elapsed = self.started.elapsed();
        self.publish_state(outcome.state());
        self.record(ExecutionEvent::RunFinished {
            run_id: self.id,
            outcome: outcome.clone(),
            elapsed_s: elapsed.as_secs_f64(),
        });
        match &outcome {
            RunOutcome::Completed => {
                info!(elapsed_s = elapsed.as_secs_f64(), lines = self.lines_completed, "run completed")
            }
            RunOutcome::Aborted { reason } => {
                warn!(elapsed_s = elapsed.as_secs_f64(), ?reason, "run aborted")
            }
            RunOutcome::Faulted { error } => {
                error!(elapsed_s = elapsed.as_secs_f64(), error = %error, "run faulted")
            }
        }

        RunReport {
            run_id: self.id,
            outcome,
            elapsed,
            lines_completed: self.lines_completed,
            retries: self.retries,
            error: self.error,
            tolerated: self.tolerated,
        }
    }

    fn fault(&self, message: String) {
        error!(%message, "run cleanup step failed");
        self.notifier.record(
            SOURCE,
            EventPayload::Fault {
                component: "engine".into(),
                message,
            },
        );
    }

    fn record(&self, event: ExecutionEvent) {
        self.notifier.record(SOURCE, EventPayload::Execution(event));
    }

    fn publish_state(&mut self, state: ExecutionState) {
        if self.ctx.state == state {
            return;
        }
        self.ctx.state = state;
        self.notifier.notify(
            SOURCE,
            EventPayload::Execution(ExecutionEvent::StateChanged {
                run_id: self.id,
                state,
            }),
        );
        self.publish_progress();
    }

    fn publish_progress(&mut self) {
        self.ctx.elapsed = self.started.elapsed();
        self.progress.send_replace(self.ctx.clone());
        self.notifier.notify(
            SOURCE,
            EventPayload::Execution(ExecutionEvent::Progress(self.ctx.clone())),
        );
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Actions
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ActionEnv {
    devices: Arc<DeviceSet>,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
    pacer: Pacer,
}

fn hardware_failure(line: usize, action: ActionKind, e: Exhausted) -> ExecutionError {
    if e.attempts > 1 {
        ExecutionError::RetriesExhausted {
            line,
            action,
            attempts: e.attempts,
            source: e.error,
        }
    } else {
        ExecutionError::Hardware {
            line,
            action,
            source: e.error,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ActionEnv {
    /// One action under its timeout: nominal duration plus the configured
    /// allowance.
    async fn perform(
        &self,
        line: usize,
        action: &ProtocolAction,
        retries: &mut u32,
    ) -> Result<(), ExecutionError> {
        let origin = MotionOrigin {
            position_mm: self.devices.actuator().position(),
            home_speed_mm_s: self.config.home_speed_mm_s,
        };
        let budget = action.duration(&origin) + self.config.action_timeout();
        match tokio::time::timeout(budget, self.act(line, action, retries)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::ActionTimeout {
                line,
                action: action.kind(),
                timeout_ms: millis(budget),
            }),
        }
    }

    async fn act(
        &self,
        line: usize,
        action: &ProtocolAction,
        retries: &mut u32,
    ) -> Result<(), ExecutionError> {
        let kind = action.kind();
        let done = match action {
            ProtocolAction::LaserSet { power_watts } => {
                let watts = *power_watts;
                self.retried(DeviceKind::Laser, retries, move |d| d.laser().set_power(watts))
                    .await
            }
            ProtocolAction::LaserRamp {
                start_watts,
                end_watts,
                duration_s,
                curve,
            } => {
                self.ramp(*start_watts, *end_watts, seconds(*duration_s), *curve, retries)
                    .await
            }
            ProtocolAction::Move {
                target,
                speed_mm_s,
                mode,
            } => self.travel(target.mm(), *speed_mm_s, *mode, retries).await,
            ProtocolAction::Home => self.home(retries).await,
            ProtocolAction::Dwell { duration_s } => {
                self.pacer.clone().sleep(seconds(*duration_s)).await;
                Ok(())
            }
        };
        done.map_err(|e| hardware_failure(line, kind, e))
    }

    async fn ramp(
        &self,
        start: f64,
        end: f64,
        total: Duration,
        curve: RampCurve,
        retries: &mut u32,
    ) -> Result<(), Exhausted> {
        let step = self.config.ramp_step().max(Duration::from_millis(1));
        let steps = (total.as_secs_f64() / step.as_secs_f64()).ceil().max(1.0) as u32;
        let interval = total / steps;
        for i in 0..=steps {
            let watts = curve.interpolate(start, end, f64::from(i) / f64::from(steps));
            self.retried(DeviceKind::Laser, retries, move |d| d.laser().set_power(watts))
                .await?;
            if i < steps {
                self.pacer.clone().sleep(interval).await;
            }
        }
        Ok(())
    }

    async fn travel(
        &self,
        target_mm: f64,
        speed_mm_s: f64,
        mode: MoveMode,
        retries: &mut u32,
    ) -> Result<(), Exhausted> {
        // Relative targets are resolved once so a retried command cannot
        // move twice.
        let absolute = match mode {
            MoveMode::Absolute => target_mm,
            MoveMode::Relative => {
                let from = self
                    .retried(DeviceKind::Actuator, retries, |d| d.actuator().read_position())
                    .await?;
                from + target_mm
            }
        };
        self.retried(DeviceKind::Actuator, retries, move |d| {
            d.actuator().set_position(absolute, speed_mm_s)
        })
        .await?;
        self.settle(absolute, retries).await
    }

    async fn home(&self, retries: &mut u32) -> Result<(), Exhausted> {
        self.retried(DeviceKind::Actuator, retries, |d| d.actuator().home())
            .await?;
        self.settle(0.0, retries).await
    }

    /// Poll until the stage stops, then check it stopped where it was sent.
    async fn settle(&self, target_mm: f64, retries: &mut u32) -> Result<(), Exhausted> {
        loop {
            tokio::time::sleep(self.config.motion_poll()).await;
            let moving = self
                .retried(DeviceKind::Actuator, retries, |d| d.actuator().poll_motion())
                .await?;
            if !moving {
                break;
            }
        }
        let reached = self.devices.actuator().position();
        if (reached - target_mm).abs() > self.config.position_tolerance_mm {
            return Err(Exhausted {
                attempts: 1,
                error: HardwareError::Rejected {
                    device: DeviceKind::Actuator,
                    command: "POS?".into(),
                    code: "TARGET".into(),
                    message: format!("stopped at {reached:.3} mm, expected {target_mm:.3} mm"),
                },
            });
        }
        Ok(())
    }

    async fn retried<T, F>(&self, device: DeviceKind, retries: &mut u32, f: F) -> Result<T, Exhausted>
    where
        T: Send + 'static,
        F: Fn(&DeviceSet) -> Result<T, HardwareError> + Clone + Send + 'static,
    {
        self.retry.run(retries, || self.call(device, f.clone())).await
    }

    /// Run a blocking controller call on the blocking pool.
    async fn call<T, F>(&self, device: DeviceKind, f: F) -> Result<T, HardwareError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceSet) -> Result<T, HardwareError> + Send + 'static,
    {
        let devices = Arc::clone(&self.devices);
        tokio::task::spawn_blocking(move || f(&devices))
            .await
            .unwrap_or(Err(HardwareError::Cancelled { device }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pacer
// ────────────────────────────────────────────────────────────────────────────

/// Sleeps that stop counting while the run is paused.
#[derive(Clone)]
struct Pacer(watch::Receiver<bool>);

impl Pacer {
    async fn sleep(mut self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.0.wait_for(|paused| !*paused).await.is_err() {
                // Handle dropped: nobody can pause or resume any more.
                tokio::time::sleep(remaining).await;
                return;
            }
            let slice = Instant::now();
            let paused = async { self.0.wait_for(|paused| *paused).await.is_ok() };
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return,
                true = paused => {
                    remaining = remaining.saturating_sub(slice.elapsed());
                }
            }
        }
    }
}
