//! The closed error taxonomy for pool and session operations.
//!
//! Collaborator-level failures ([`RuntimeError`](crate::runtime::RuntimeError),
//! [`TaskError`](crate::tasks::TaskError)) live beside their traits; this
//! module defines [`ControlError`], the typed surface callers of the pool,
//! controller, and facade see. Every variant carries enough context (handle
//! identity, step name, underlying collaborator error) to be logged without
//! re-deriving the failure.

use std::time::Duration;

use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::state::SessionState;
use crate::tasks::TaskError;

/// Errors surfaced by pool, session, and facade operations.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The pool's outstanding-allocation limit was reached and no handle
    /// freed up within the caller's wait.
    #[error("simulator pool exhausted: {outstanding} of {limit} allocations outstanding")]
    PoolExhausted { outstanding: usize, limit: usize },

    /// The device runtime failed to create a new simulator.
    #[error("failed to provision simulator: {source}")]
    ProvisioningFailed {
        #[source]
        source: RuntimeError,
    },

    /// The handle is not currently allocated (double free) or not known to
    /// this pool at all. A programmer error; never retried internally.
    #[error("handle {udid} is not currently allocated by this pool")]
    NotOwned { udid: String },

    /// The device failed to boot. Terminal for the session: the handle is
    /// returned to the pool and the session ends up `Terminated`.
    #[error("simulator {udid} failed to boot: {source}")]
    BootFailed {
        udid: String,
        #[source]
        source: Box<ControlError>,
    },

    /// The operation or step is not valid in the session's current state.
    #[error("'{step}' is not valid while the session is {state}")]
    InvalidState {
        step: &'static str,
        state: SessionState,
    },

    /// A pipeline step's action failed; remaining queued steps were
    /// discarded and the session kept its last good state.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: &'static str,
        #[source]
        source: Box<ControlError>,
    },

    /// A deadline elapsed. Distinct from outright failure so callers can
    /// tell "still busy" from "broken".
    #[error("'{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A collaborator could not be reached at all.
    #[error("collaborator '{name}' unavailable: {reason}")]
    CollaboratorUnavailable {
        name: &'static str,
        reason: String,
    },

    /// A device-runtime error outside the more specific variants above.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A task-runner error outside the more specific variants above.
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl ControlError {
    /// Wraps a device-runtime failure, promoting an unreachable runtime to
    /// [`CollaboratorUnavailable`](Self::CollaboratorUnavailable).
    pub(crate) fn from_runtime(source: RuntimeError) -> Self {
        match source {
            RuntimeError::Unavailable(reason) => ControlError::CollaboratorUnavailable {
                name: "device runtime",
                reason,
            },
            other => ControlError::Runtime(other),
        }
    }

    /// Wraps a task-runner failure, promoting an unreachable runner to
    /// [`CollaboratorUnavailable`](Self::CollaboratorUnavailable).
    pub(crate) fn from_task(source: TaskError) -> Self {
        match source {
            TaskError::Unavailable(reason) => ControlError::CollaboratorUnavailable {
                name: "task runner",
                reason,
            },
            other => ControlError::Task(other),
        }
    }

    /// True for errors that represent a deadline rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ControlError::Timeout { .. }
                | ControlError::Runtime(RuntimeError::Timeout)
                | ControlError::Task(TaskError::WaitTimeout { .. })
        )
    }
}
