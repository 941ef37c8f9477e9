//! # simpool-core
//!
//! Core library for managing a scarce pool of iOS Simulators on behalf of
//! concurrent automated-test and tooling clients.
//!
//! The crate coordinates allocation, booting, app install/launch, and
//! teardown of simulators. The device-virtualization runtime itself is not
//! reimplemented here; it is consumed through collaborator traits so the
//! orchestration core stays testable without a Mac or Xcode.
//!
//! ## Modules
//!
//! - [`facade`] - [`ControlFacade`](facade::ControlFacade), the top-level
//!   entry point owning the pool and vending sessions
//! - [`pool`] - the simulator pool: allocation, freeing, reclaiming
//! - [`controller`] - per-session lifecycle state machine
//! - [`pipeline`] - ordered interaction steps with abort-on-failure
//! - [`runtime`] - the `DeviceRuntime` collaborator seam (`xcrun simctl`)
//! - [`tasks`] - the `TaskRunner` collaborator seam (host processes)
//! - [`diagnostics`] - best-effort log and crash-report collection
//! - [`state`] - session states and broadcast events
//! - [`config`] - pool, simulator, and app-launch configuration
//! - [`error`] - the closed [`ControlError`](error::ControlError) taxonomy
//!
//! ## Example
//!
//! ```no_run
//! use simpool_core::config::{AppLaunchConfig, ControlConfig, SimulatorConfig};
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
//! session
//!     .install_and_launch(&AppLaunchConfig::new("com.example.app"))
//!     .await?;
//! session.terminate().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod facade;
pub mod pipeline;
pub mod pool;
pub mod runtime;
pub mod state;
pub mod tasks;

pub use config::{AppLaunchConfig, ControlConfig, SimulatorConfig};
pub use controller::SessionController;
pub use error::ControlError;
pub use facade::ControlFacade;
pub use pool::{ResourceHandle, SimulatorPool};
pub use state::{SessionEvent, SessionState};
