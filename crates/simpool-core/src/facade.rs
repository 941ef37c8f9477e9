//! Top-level entry point owning the pool and vending sessions.
//!
//! A [`ControlFacade`] is explicitly constructed and passed by reference;
//! there is no process-wide shared instance. Its lifecycle is explicit:
//! [`start`](ControlFacade::start) adopts existing devices (and optionally
//! sweeps orphaned helper processes), [`create_session`] vends
//! [`SessionController`]s, and [`shutdown`](ControlFacade::shutdown) runs a
//! final best-effort sweep.
//!
//! [`create_session`]: ControlFacade::create_session
//!
//! # Example
//!
//! ```no_run
//! use simpool_core::config::{ControlConfig, SimulatorConfig};
//! use simpool_core::facade::ControlFacade;
//!
//! # async fn example() -> Result<(), simpool_core::error::ControlError> {
//! let facade = ControlFacade::with_host_collaborators(ControlConfig::default());
//! facade.start().await?;
//!
//! let session = facade
//!     .create_session(&SimulatorConfig::new("iPhone 15", "17.0"))
//!     .await?;
//! session.boot().await?;
//! session.terminate().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::{ControlConfig, SimulatorConfig};
use crate::controller::SessionController;
use crate::diagnostics::{DiagnosticsSink, SimulatorLogSink};
use crate::error::ControlError;
use crate::pool::SimulatorPool;
use crate::runtime::{DeviceRuntime, SimctlRuntime};
use crate::tasks::{HostTaskRunner, TaskRunner};

/// Entry point for creating, launching, and cleaning up simulators.
pub struct ControlFacade {
    config: ControlConfig,
    pool: Arc<SimulatorPool>,
    runtime: Arc<dyn DeviceRuntime>,
    tasks: Arc<dyn TaskRunner>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl ControlFacade {
    /// Builds a facade over the given collaborators.
    pub fn new(
        config: ControlConfig,
        runtime: Arc<dyn DeviceRuntime>,
        tasks: Arc<dyn TaskRunner>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let pool = Arc::new(SimulatorPool::new(
            Arc::clone(&runtime),
            Arc::clone(&tasks),
            &config,
        ));
        Self {
            config,
            pool,
            runtime,
            tasks,
            diagnostics,
        }
    }

    /// Builds a facade over the real host collaborators: `xcrun simctl`,
    /// host process spawning, and the CoreSimulator log directory.
    pub fn with_host_collaborators(config: ControlConfig) -> Self {
        Self::new(
            config,
            Arc::new(SimctlRuntime::new()),
            Arc::new(HostTaskRunner::new()),
            Arc::new(SimulatorLogSink::new()),
        )
    }

    /// The configuration this facade was built with.
    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// The pool owned by this facade.
    pub fn pool(&self) -> &Arc<SimulatorPool> {
        &self.pool
    }

    /// Initializes the facade: sweeps orphaned helper processes when
    /// configured to, then adopts devices already present for the bucket.
    ///
    /// Returns the number of adopted devices.
    pub async fn start(&self) -> Result<usize, ControlError> {
        if self.config.kill_spurious_on_start {
            self.pool.kill_spurious_processes().await;
        }
        let adopted = self.pool.discover().await?;
        info!(bucket = %self.pool.bucket(), adopted, "facade started");
        Ok(adopted)
    }

    /// Allocates a simulator matching `config` and wraps it in a new
    /// session. Does not boot the device or launch anything.
    pub async fn create_session(
        &self,
        config: &SimulatorConfig,
    ) -> Result<Arc<SessionController>, ControlError> {
        SessionController::create(
            Arc::clone(&self.pool),
            Arc::clone(&self.runtime),
            Arc::clone(&self.tasks),
            Arc::clone(&self.diagnostics),
            &self.config,
            config,
        )
        .await
    }

    /// Final best-effort cleanup sweep. Sessions still running are not
    /// touched; terminating them is their owners' responsibility.
    pub async fn shutdown(&self) {
        self.pool.kill_spurious_processes().await;
        info!(bucket = %self.pool.bucket(), "facade shut down");
    }
}

impl std::fmt::Debug for ControlFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlFacade")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}
