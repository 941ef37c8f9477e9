//! The sequential interaction pipeline that drives one session.
//!
//! A [`Pipeline`] is a builder accumulating [`Step`]s; execution drains the
//! queue strictly in insertion order. Each step's precondition is checked
//! against the session's *current* state immediately before it runs, not at
//! enqueue time, because enqueued steps may span multiple pipeline
//! invocations.
//!
//! Failure policy:
//!
//! - precondition miss: the step fails with `InvalidState` without its
//!   action running;
//! - action failure: the pipeline aborts, remaining steps are discarded
//!   (never executed, never retried), the session state is restored to the
//!   state observed when the pipeline started, and the error names the step;
//! - diagnostics steps are the exception: best-effort, run in the
//!   background, individual failures land in the warnings list;
//! - cancellation (terminate while a step is in flight): the in-flight step
//!   completes, no further queued steps run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::AppLaunchConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::error::ControlError;
use crate::runtime::DeviceRuntime;
use crate::state::{SessionEvent, SessionState};
use crate::tasks::{ProcessHandle, TaskRunner, TaskSpec};

/// What a step does when it runs.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Boot the device via the device runtime.
    Boot,
    /// Install the app bundle. A no-op when the config has no bundle path.
    InstallApp(AppLaunchConfig),
    /// Launch the app; the launched process handle is retained for
    /// termination.
    LaunchApp(AppLaunchConfig),
    /// Open a URL on the device.
    OpenUrl(String),
    /// Best-effort diagnostics collection; runs in the background.
    CollectDiagnostics,
}

/// One named, ordered unit of device interaction.
#[derive(Debug, Clone)]
pub struct Step {
    /// Step name used in errors, events, and spans.
    pub name: &'static str,
    /// States the session must be in for the action to run. Empty means any
    /// live state.
    pub required: &'static [SessionState],
    /// Transitional state entered just before the action runs.
    pub during: Option<SessionState>,
    /// State entered when the action succeeds. `None` keeps `during`.
    pub after: Option<SessionState>,
    /// Best-effort steps never abort the pipeline.
    pub best_effort: bool,
    pub kind: StepKind,
}

impl Step {
    pub fn boot() -> Self {
        Self {
            name: "boot",
            required: &[SessionState::Created],
            during: Some(SessionState::Booting),
            after: Some(SessionState::Booted),
            best_effort: false,
            kind: StepKind::Boot,
        }
    }

    pub fn install(app: AppLaunchConfig) -> Self {
        Self {
            name: "install",
            required: &[SessionState::Booted, SessionState::AppRunning],
            during: Some(SessionState::AppInstalling),
            after: None,
            best_effort: false,
            kind: StepKind::InstallApp(app),
        }
    }

    pub fn launch(app: AppLaunchConfig) -> Self {
        Self {
            name: "launch",
            required: &[SessionState::AppInstalling],
            during: Some(SessionState::AppLaunching),
            after: Some(SessionState::AppRunning),
            best_effort: false,
            kind: StepKind::LaunchApp(app),
        }
    }

    pub fn open_url(url: impl Into<String>) -> Self {
        Self {
            name: "open_url",
            required: &[SessionState::Booted, SessionState::AppRunning],
            during: None,
            after: None,
            best_effort: false,
            kind: StepKind::OpenUrl(url.into()),
        }
    }

    pub fn collect_diagnostics() -> Self {
        Self {
            name: "collect_diagnostics",
            required: &[],
            during: None,
            after: None,
            best_effort: true,
            kind: StepKind::CollectDiagnostics,
        }
    }

    /// Whether the step's precondition accepts `state`.
    pub fn accepts(&self, state: SessionState) -> bool {
        if self.required.is_empty() {
            return !state.is_terminal();
        }
        self.required.contains(&state)
    }
}

/// Everything a running pipeline touches: collaborators, the shared session
/// state, and the session's accumulators.
///
/// Built by the session controller; pipeline execution never reaches into
/// the controller itself.
pub(crate) struct StepContext {
    pub(crate) runtime: Arc<dyn DeviceRuntime>,
    pub(crate) tasks: Arc<dyn TaskRunner>,
    pub(crate) diagnostics: Arc<dyn DiagnosticsSink>,
    pub(crate) udid: Arc<str>,
    pub(crate) state: Arc<RwLock<SessionState>>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) collaborator_timeout: Duration,
    pub(crate) artifacts: Arc<Mutex<std::collections::HashMap<String, std::path::PathBuf>>>,
    pub(crate) warnings: Arc<Mutex<Vec<String>>>,
    pub(crate) launched: Arc<Mutex<Vec<ProcessHandle>>>,
}

impl StepContext {
    pub(crate) async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Sets the state and broadcasts the change. The pipeline and controller
    /// are the only writers. In debug builds an off-ladder move is a bug.
    pub(crate) async fn transition(&self, to: SessionState) {
        let from = self.set_state(to).await;
        debug_assert!(
            from == to || from.can_transition(to),
            "invalid session transition {from} -> {to}"
        );
    }

    /// Restores the state recorded at pipeline entry after a failed step.
    /// Deliberately unchecked: rolling a transitional state back to the
    /// entry state steps off the forward ladder.
    pub(crate) async fn restore(&self, to: SessionState) {
        self.set_state(to).await;
    }

    async fn set_state(&self, to: SessionState) -> SessionState {
        let from = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            debug!(udid = %self.udid, %from, %to, "state changed");
            let _ = self.events.send(SessionEvent::StateChanged { from, to });
        }
        from
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is expected.
        let _ = self.events.send(event);
    }

    pub(crate) async fn record_warning(&self, message: String) {
        warn!(udid = %self.udid, "{}", message);
        self.warnings.lock().await.push(message.clone());
        self.emit(SessionEvent::Warning { message });
    }

    /// Collects diagnostics into the artifact map; failures become warnings.
    pub(crate) async fn collect_diagnostics(&self) {
        match self.diagnostics.collect(&self.udid).await {
            Ok(collected) => {
                let mut artifacts = self.artifacts.lock().await;
                for (name, path) in collected {
                    self.emit(SessionEvent::ArtifactCollected {
                        name: name.clone(),
                        path: path.clone(),
                    });
                    artifacts.insert(name, path);
                }
            }
            Err(e) => {
                self.record_warning(format!("diagnostics collection failed: {}", e))
                    .await;
            }
        }
    }

    /// Clones the Arcs a background diagnostics task needs.
    fn diagnostics_task(&self) -> StepContext {
        StepContext {
            runtime: Arc::clone(&self.runtime),
            tasks: Arc::clone(&self.tasks),
            diagnostics: Arc::clone(&self.diagnostics),
            udid: Arc::clone(&self.udid),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            collaborator_timeout: self.collaborator_timeout,
            artifacts: Arc::clone(&self.artifacts),
            warnings: Arc::clone(&self.warnings),
            launched: Arc::clone(&self.launched),
        }
    }
}

/// Ordered, composable sequence of steps executed against one session.
#[derive(Default)]
pub struct Pipeline {
    steps: VecDeque<Step>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn then_boot(self) -> Self {
        self.then(Step::boot())
    }

    pub fn then_install(self, app: AppLaunchConfig) -> Self {
        self.then(Step::install(app))
    }

    pub fn then_launch(self, app: AppLaunchConfig) -> Self {
        self.then(Step::launch(app))
    }

    pub fn then_open_url(self, url: impl Into<String>) -> Self {
        self.then(Step::open_url(url))
    }

    pub fn then_collect_diagnostics(self) -> Self {
        self.then(Step::collect_diagnostics())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    /// Drains and executes the queue in insertion order.
    pub(crate) async fn run(&mut self, ctx: &StepContext) -> Result<(), ControlError> {
        let entry_state = ctx.state().await;

        while let Some(step) = self.steps.pop_front() {
            if ctx.cancel.is_cancelled() {
                debug!(step = step.name, "termination requested, discarding remaining steps");
                self.steps.clear();
                return Err(ControlError::InvalidState {
                    step: step.name,
                    state: ctx.state().await,
                });
            }

            // Best-effort steps run in the background and never gate the
            // queue; later steps may overlap them.
            if step.best_effort {
                let task_ctx = ctx.diagnostics_task();
                ctx.emit(SessionEvent::StepStarted {
                    step: step.name.to_string(),
                });
                tokio::spawn(async move {
                    task_ctx.collect_diagnostics().await;
                    task_ctx.emit(SessionEvent::StepCompleted {
                        step: step.name.to_string(),
                    });
                });
                continue;
            }

            // Precondition against the current state, at run time.
            let current = ctx.state().await;
            if !step.accepts(current) {
                self.steps.clear();
                return Err(ControlError::InvalidState {
                    step: step.name,
                    state: current,
                });
            }

            ctx.emit(SessionEvent::StepStarted {
                step: step.name.to_string(),
            });
            if let Some(during) = step.during {
                ctx.transition(during).await;
            }

            let span = info_span!("run_step", step = step.name, udid = %ctx.udid);
            let start = tokio::time::Instant::now();
            let result = execute_action(ctx, &step.kind).instrument(span).await;
            debug!(
                step = step.name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                success = result.is_ok(),
                "step complete"
            );

            match result {
                Ok(()) => {
                    if let Some(after) = step.after {
                        ctx.transition(after).await;
                    }
                    ctx.emit(SessionEvent::StepCompleted {
                        step: step.name.to_string(),
                    });
                }
                Err(cause) => {
                    self.steps.clear();
                    // Last-good-state guarantee: transitional states never
                    // survive a failure.
                    ctx.restore(entry_state).await;
                    ctx.emit(SessionEvent::StepFailed {
                        step: step.name.to_string(),
                        message: cause.to_string(),
                    });
                    return Err(ControlError::StepFailed {
                        step: step.name,
                        source: Box::new(cause),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Runs one step's action against the collaborators.
async fn execute_action(ctx: &StepContext, kind: &StepKind) -> Result<(), ControlError> {
    match kind {
        StepKind::Boot => {
            let timeout = ctx.collaborator_timeout;
            tokio::time::timeout(timeout, ctx.runtime.boot(&ctx.udid))
                .await
                .map_err(|_| ControlError::Timeout {
                    operation: "boot device",
                    after: timeout,
                })?
                .map_err(ControlError::from_runtime)?;
            Ok(())
        }

        StepKind::InstallApp(app) => {
            let Some(path) = &app.app_path else {
                debug!(bundle = %app.bundle_id, "no app bundle path, skipping install");
                return Ok(());
            };
            let spec = TaskSpec::new("xcrun")
                .args(["simctl", "install"])
                .arg(ctx.udid.as_ref())
                .arg(path.to_string_lossy());
            run_to_completion(ctx, spec, "install app").await
        }

        StepKind::LaunchApp(app) => {
            let mut spec = TaskSpec::new("xcrun")
                .args(["simctl", "launch"])
                .arg(ctx.udid.as_ref())
                .arg(&app.bundle_id)
                .args(app.args.iter().cloned());
            for (key, value) in &app.env {
                // simctl forwards SIMCTL_CHILD_-prefixed variables to the app.
                spec = spec.env(format!("SIMCTL_CHILD_{}", key), value);
            }

            let handle = ctx
                .tasks
                .launch(spec)
                .await
                .map_err(ControlError::from_task)?;
            // The handle is the session's link to the running app; terminate
            // uses it to stop whatever is still alive.
            ctx.launched.lock().await.push(handle);
            Ok(())
        }

        StepKind::OpenUrl(url) => {
            let spec = TaskSpec::new("xcrun")
                .args(["simctl", "openurl"])
                .arg(ctx.udid.as_ref())
                .arg(url);
            run_to_completion(ctx, spec, "open url").await
        }

        // Handled as a background task in `Pipeline::run`; direct calls go
        // through `StepContext::collect_diagnostics`.
        StepKind::CollectDiagnostics => {
            ctx.collect_diagnostics().await;
            Ok(())
        }
    }
}

/// Launches a task and waits for a clean exit within the collaborator
/// deadline, mapping the deadline to the core `Timeout` kind.
async fn run_to_completion(
    ctx: &StepContext,
    spec: TaskSpec,
    operation: &'static str,
) -> Result<(), ControlError> {
    let timeout = ctx.collaborator_timeout;
    let handle = ctx
        .tasks
        .launch(spec)
        .await
        .map_err(ControlError::from_task)?;
    handle.wait_success(timeout).await.map_err(|e| match e {
        crate::tasks::TaskError::WaitTimeout { .. } => ControlError::Timeout {
            operation,
            after: timeout,
        },
        other => ControlError::Task(other),
    })
}
