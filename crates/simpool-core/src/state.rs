//! Session lifecycle state machine and observable session events.
//!
//! A session moves through the states below. `Terminated` is absorbing; any
//! non-terminal state may jump to `Terminating` on an explicit termination
//! request or a fatal failure. Termination is the only error-recovery path
//! that leaves the ladder; there is no silent re-entry to an earlier state.
//!
//! ```text
//! Created -> Booting -> Booted -> (AppInstalling -> AppLaunching -> AppRunning)*
//!     \________________________________________________/
//!                        |
//!                   Terminating -> Terminated
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one session and its simulator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Handle allocated, device not yet booted.
    Created,
    /// Boot in progress.
    Booting,
    /// Device booted, no app activity in flight.
    Booted,
    /// App install in progress.
    AppInstalling,
    /// App launch in progress.
    AppLaunching,
    /// App launched and presumed running.
    AppRunning,
    /// Teardown in progress.
    Terminating,
    /// Session finished; the handle has been returned to the pool.
    /// No transition leaves this state.
    Terminated,
}

impl SessionState {
    /// Returns true for the absorbing final state.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }

    /// Returns true if the device is expected to be booted in this state.
    pub fn is_booted(self) -> bool {
        matches!(
            self,
            SessionState::Booted
                | SessionState::AppInstalling
                | SessionState::AppLaunching
                | SessionState::AppRunning
        )
    }

    /// Whether the state machine permits a transition to `next`.
    ///
    /// Any non-terminal state may move to `Terminating`; everything else
    /// follows the ladder, with `AppRunning -> AppInstalling` allowed so a
    /// session can install and relaunch repeatedly.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        if self == Terminated {
            return false;
        }
        if next == Terminating {
            return true;
        }
        matches!(
            (self, next),
            (Created, Booting)
                | (Booting, Booted)
                | (Booted, AppInstalling)
                | (AppInstalling, AppLaunching)
                | (AppLaunching, AppRunning)
                | (AppRunning, AppInstalling)
                | (Terminating, Terminated)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Booting => "booting",
            SessionState::Booted => "booted",
            SessionState::AppInstalling => "app-installing",
            SessionState::AppLaunching => "app-launching",
            SessionState::AppRunning => "app-running",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Events broadcast to subscribers as a session progresses.
///
/// Observability tooling subscribes via
/// [`SessionController::subscribe`](crate::controller::SessionController::subscribe).
/// Receivers that lag too far behind may miss events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The session moved from one lifecycle state to another.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// A pipeline step began executing.
    StepStarted { step: String },
    /// A pipeline step completed successfully.
    StepCompleted { step: String },
    /// A pipeline step failed; remaining queued steps were discarded.
    StepFailed { step: String, message: String },
    /// A diagnostic artifact was collected.
    ArtifactCollected { name: String, path: PathBuf },
    /// A non-fatal problem was recorded (diagnostics failures and the like).
    Warning { message: String },
}
