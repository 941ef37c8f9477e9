//! Session controller: one allocated simulator, driven through its lifecycle.
//!
//! A [`SessionController`] owns exactly one [`ResourceHandle`] for its whole
//! lifetime and is the only writer of the session's state machine. It vends
//! lifecycle operations (`boot`, `install_and_launch`, `open_url`,
//! `terminate`), broadcasts [`SessionEvent`]s to subscribers, and persists
//! every event to a JSON Lines file under the configured state directory
//! (`~/.simpool/logs/` by default) for later inspection.
//!
//! Failure policy, in brief: a failed boot is terminal (the device is
//! presumed unusable, the handle goes back to the pool); app-level failures
//! are recoverable (the session keeps its last good state for caller-driven
//! retry); diagnostics failures are warnings, never errors.

use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AppLaunchConfig, ControlConfig, SimulatorConfig};
use crate::diagnostics::DiagnosticsSink;
use crate::error::ControlError;
use crate::pipeline::{Pipeline, StepContext};
use crate::pool::{ResourceHandle, SimulatorPool};
use crate::runtime::DeviceRuntime;
use crate::state::{SessionEvent, SessionState};
use crate::tasks::TaskRunner;

/// Capacity of the session event broadcast channel.
const EVENT_CHANNEL_SIZE: usize = 128;

/// Controls one session over one allocated simulator.
///
/// Created via [`SessionController::create`], which allocates from the pool.
/// The controller is cheaply sharable as an `Arc`; all operations take
/// `&self` and pipeline execution is internally serialized, so concurrent
/// callers of the same session are rejected rather than interleaved.
pub struct SessionController {
    id: Uuid,
    created_at: DateTime<Utc>,
    handle: ResourceHandle,
    pool: Arc<SimulatorPool>,
    ctx: StepContext,
    /// Serializes pipeline execution for this session. `terminate` acquires
    /// it to let an in-flight step finish before teardown.
    pipeline_busy: Mutex<()>,
    /// Flipped exactly once; makes `terminate` idempotent and the pool
    /// `free` single-shot.
    terminated: AtomicBool,
}

impl SessionController {
    /// Allocates a handle from the pool and wraps it in a new session.
    ///
    /// The session starts in `Created`; nothing is booted or launched yet.
    ///
    /// # Errors
    ///
    /// Any allocation error from [`SimulatorPool::allocate`]
    /// (`PoolExhausted`, `ProvisioningFailed`, `Timeout`).
    pub async fn create(
        pool: Arc<SimulatorPool>,
        runtime: Arc<dyn DeviceRuntime>,
        tasks: Arc<dyn TaskRunner>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        control: &ControlConfig,
        config: &SimulatorConfig,
    ) -> Result<Arc<Self>, ControlError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let handle = pool.allocate(config, id, control.allocate_timeout).await?;
        info!(session = %id, udid = %handle.udid(), config = %config, "session created");

        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        spawn_event_logger(id, created_at, control.logs_dir(), event_rx);

        let ctx = StepContext {
            runtime,
            tasks,
            diagnostics,
            udid: handle.udid().into(),
            state: Arc::new(RwLock::new(SessionState::Created)),
            events: event_tx,
            cancel: CancellationToken::new(),
            collaborator_timeout: control.collaborator_timeout,
            artifacts: Arc::new(Mutex::new(HashMap::new())),
            warnings: Arc::new(Mutex::new(Vec::new())),
            launched: Arc::new(Mutex::new(Vec::new())),
        };

        Ok(Arc::new(Self {
            id,
            created_at,
            handle,
            pool,
            ctx,
            pipeline_busy: Mutex::new(()),
            terminated: AtomicBool::new(false),
        }))
    }

    /// The session's unique identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The handle this session exclusively owns.
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// The UDID of the session's simulator.
    pub fn udid(&self) -> &str {
        self.handle.udid()
    }

    /// The session's current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.ctx.state().await
    }

    /// Subscribes to session events. Receivers that lag may miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Diagnostic artifacts collected so far, keyed by source name.
    pub async fn artifacts(&self) -> HashMap<String, PathBuf> {
        self.ctx.artifacts.lock().await.clone()
    }

    /// Non-fatal problems recorded so far (diagnostics failures and the
    /// like).
    pub async fn warnings(&self) -> Vec<String> {
        self.ctx.warnings.lock().await.clone()
    }

    /// Boots the session's simulator.
    ///
    /// Valid only from `Created`. On success the session is `Booted`. A boot
    /// failure is terminal: the session is terminated, the handle returns to
    /// the pool, and the error surfaces as [`ControlError::BootFailed`].
    /// There is no retry on the same handle.
    pub async fn boot(&self) -> Result<(), ControlError> {
        let guard = match self.pipeline_busy.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(ControlError::InvalidState {
                    step: "boot",
                    state: self.state().await,
                })
            }
        };

        let state = self.state().await;
        if state != SessionState::Created {
            return Err(ControlError::InvalidState { step: "boot", state });
        }

        let mut pipeline = Pipeline::new().then_boot();
        let result = pipeline.run(&self.ctx).await;
        drop(guard);

        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                warn!(session = %self.id, udid = %self.udid(), error = %source, "boot failed, terminating session");
                self.terminate().await;
                Err(ControlError::BootFailed {
                    udid: self.udid().to_string(),
                    source: Box::new(source),
                })
            }
        }
    }

    /// Installs and launches an app on the booted simulator.
    ///
    /// Valid from `Booted` (first launch) or `AppRunning` (reinstall and
    /// relaunch). On failure the session keeps the state it entered with, so
    /// the caller may retry or inspect diagnostics. A call while another
    /// pipeline is in flight is rejected with `InvalidState`.
    pub async fn install_and_launch(&self, app: &AppLaunchConfig) -> Result<(), ControlError> {
        let _guard = match self.pipeline_busy.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(ControlError::InvalidState {
                    step: "install_and_launch",
                    state: self.state().await,
                })
            }
        };

        let state = self.state().await;
        if !matches!(state, SessionState::Booted | SessionState::AppRunning) {
            return Err(ControlError::InvalidState {
                step: "install_and_launch",
                state,
            });
        }

        Pipeline::new()
            .then_install(app.clone())
            .then_launch(app.clone())
            .then_collect_diagnostics()
            .run(&self.ctx)
            .await
    }

    /// Opens a URL on the booted simulator.
    ///
    /// Valid from `Booted` or `AppRunning`; does not change the session
    /// state.
    pub async fn open_url(&self, url: impl Into<String>) -> Result<(), ControlError> {
        let _guard = match self.pipeline_busy.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(ControlError::InvalidState {
                    step: "open_url",
                    state: self.state().await,
                })
            }
        };

        Pipeline::new().then_open_url(url).run(&self.ctx).await
    }

    /// Collects diagnostics now and returns the accumulated artifact map.
    ///
    /// Best-effort: collection failures land in [`warnings`](Self::warnings)
    /// and the call still succeeds.
    pub async fn collect_diagnostics(&self) -> HashMap<String, PathBuf> {
        self.ctx.collect_diagnostics().await;
        self.artifacts().await
    }

    /// Terminates the session and returns its handle to the pool.
    ///
    /// Idempotent; the second and later calls are no-ops. Termination is the
    /// universal recovery path from any non-terminal state: an in-flight
    /// pipeline step is allowed to complete (device operations are not
    /// safely interruptible), then queued steps are discarded, launched
    /// processes are stopped, the device is shut down if it booted, and the
    /// handle is freed exactly once.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(session = %self.id, "terminate called again, ignoring");
            return;
        }

        // Stop the pipeline after its current step, then wait for it.
        self.ctx.cancel.cancel();
        let _guard = self.pipeline_busy.lock().await;

        let prior = self.ctx.state().await;
        info!(session = %self.id, udid = %self.udid(), %prior, "terminating session");
        self.ctx.transition(SessionState::Terminating).await;

        let launched: Vec<_> = self.ctx.launched.lock().await.drain(..).collect();
        for handle in &launched {
            if !handle.has_exited() {
                self.ctx.tasks.terminate(handle).await;
            }
        }

        if prior.is_booted() || prior == SessionState::Booting {
            if let Err(e) = self.ctx.runtime.shutdown(self.udid()).await {
                warn!(session = %self.id, udid = %self.udid(), error = %e, "device shutdown failed during terminate");
            }
        }

        if let Err(e) = self.pool.free(&self.handle).await {
            // Only reachable if the handle was reclaimed out from under us.
            warn!(session = %self.id, udid = %self.udid(), error = %e, "handle was no longer allocated");
        }

        self.ctx.transition(SessionState::Terminated).await;
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("id", &self.id)
            .field("udid", &self.handle.udid())
            .field("created_at", &self.created_at)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

/// Spawns the task that persists session events as JSON Lines under the
/// configured log directory. Ends when the session's event sender is
/// dropped.
fn spawn_event_logger(
    id: Uuid,
    created_at: DateTime<Utc>,
    logs_dir: PathBuf,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    let timestamp = created_at.format("%Y%m%d_%H%M%S");
    let path = logs_dir.join(format!("session_{}_{}.jsonl", id, timestamp));
    let Some(file) = std::fs::File::create(&path).ok() else {
        warn!(session = %id, path = %path.display(), "could not create session log file");
        return;
    };
    let mut writer = BufWriter::new(file);

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        let _ = writeln!(writer, "{}", json);
                        let _ = writer.flush();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %id, skipped, "session log lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
