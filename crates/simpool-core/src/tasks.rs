//! Task runner collaborator: launch and terminate host processes.
//!
//! [`TaskRunner`] is the seam for everything the core runs as an OS process:
//! app installs, app launches, URL opens, and the spurious-process sweep.
//! [`ProcessHandle`] is the cancelable completion handle the contract
//! requires: the spawned child is owned by a dedicated wait task that
//! captures the real exit code; the handle holds a one-shot kill channel, an
//! atomic exited flag, and a [`Notify`] so waiters never poll.
//!
//! [`HostTaskRunner`] is the shipped implementation using
//! `tokio::process::Command`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Errors from the task runner collaborator.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The process could not be spawned.
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// The runner's tooling could not be reached at all (program missing).
    #[error("task runner unavailable: {0}")]
    Unavailable(String),

    /// The process exited with a non-zero status.
    #[error("process {pid:?} exited with status {code}")]
    Failed { pid: Option<u32>, code: i32 },

    /// The process did not exit within the caller's deadline.
    #[error("process {pid:?} did not exit within {timeout:?}")]
    WaitTimeout { pid: Option<u32>, timeout: Duration },

    /// Enumerating helper processes failed.
    #[error("process listing failed: {0}")]
    ListFailed(String),

    /// Killing a process by pid failed.
    #[error("failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to launch: program, arguments, environment.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl TaskSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A simulator helper process found by the spurious-process sweep.
#[derive(Debug, Clone)]
pub struct HelperProcess {
    pub pid: u32,
    /// The device UDID extracted from the process command line, if any.
    pub udid: Option<String>,
}

/// Cancelable completion handle for one launched process.
///
/// Runners build handles via [`ProcessHandle::from_parts`]; the wait task
/// that owns the child sets the exit code, flips the exited flag, and
/// notifies waiters, in that order, so [`has_exited`](Self::has_exited) is
/// already true when a waiter wakes.
pub struct ProcessHandle {
    pid: Option<u32>,
    /// Consumed on first kill request.
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<OnceLock<i32>>,
    exit_notify: Arc<Notify>,
}

impl ProcessHandle {
    /// Assembles a handle from the shared primitives a runner's wait task
    /// holds the other ends of.
    pub fn from_parts(
        pid: Option<u32>,
        kill_tx: oneshot::Sender<()>,
        exited: Arc<AtomicBool>,
        exit_code: Arc<OnceLock<i32>>,
        exit_notify: Arc<Notify>,
    ) -> Self {
        Self {
            pid,
            kill_tx: StdMutex::new(Some(kill_tx)),
            exited,
            exit_code,
            exit_notify,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking check backed by the wait task's atomic flag.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// The exit code, once the process has exited. `None` while running or
    /// when the process was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    /// Asks the wait task to force-kill the process. A no-op if the process
    /// already exited or a kill was already requested.
    pub fn request_kill(&self) {
        let tx = self.kill_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tx) = tx {
            // The wait task may have already finished; that's fine.
            let _ = tx.send(());
        }
    }

    /// Waits for the process to exit and returns its exit code.
    ///
    /// The notified future is created before the exited check so a
    /// notification firing between the check and the await cannot be missed.
    pub async fn wait(&self, timeout: Duration) -> Result<i32, TaskError> {
        let notified = self.exit_notify.notified();
        if !self.has_exited() {
            tokio::time::timeout(timeout, notified)
                .await
                .map_err(|_| TaskError::WaitTimeout {
                    pid: self.pid,
                    timeout,
                })?;
        }
        Ok(self.exit_code().unwrap_or(-1))
    }

    /// Like [`wait`](Self::wait), but treats a non-zero exit status as
    /// [`TaskError::Failed`].
    pub async fn wait_success(&self, timeout: Duration) -> Result<(), TaskError> {
        match self.wait(timeout).await? {
            0 => Ok(()),
            code => Err(TaskError::Failed {
                pid: self.pid,
                code,
            }),
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

/// Abstract contract for launching and terminating OS processes.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Launches `spec` and returns its completion handle.
    async fn launch(&self, spec: TaskSpec) -> Result<ProcessHandle, TaskError>;

    /// Terminates a launched process: requests a kill and waits briefly for
    /// the wait task to reap it.
    async fn terminate(&self, handle: &ProcessHandle) {
        handle.request_kill();
        if handle.wait(Duration::from_secs(2)).await.is_err() {
            warn!(pid = ?handle.pid(), "process did not exit after kill request");
        }
    }

    /// Enumerates simulator helper processes on the host.
    async fn list_simulator_processes(&self) -> Result<Vec<HelperProcess>, TaskError>;

    /// Kills an arbitrary process by pid. Used by the spurious sweep.
    async fn kill(&self, pid: u32) -> Result<(), TaskError>;
}

// ---------------------------------------------------------------------------
// Host implementation
// ---------------------------------------------------------------------------

/// Task runner that spawns real processes on the host.
pub struct HostTaskRunner;

impl HostTaskRunner {
    pub fn new() -> Self {
        Self
    }

    /// Background task: owns the child, waits for it to exit, records the
    /// exit code, and wakes waiters. Two ways out: natural exit, or the kill
    /// channel fires and we kill first.
    async fn wait_for_exit(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        exited: Arc<AtomicBool>,
        exit_code: Arc<OnceLock<i32>>,
        exit_notify: Arc<Notify>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => {
                    debug!(?status, "process exited");
                    status.code()
                }
                Err(e) => {
                    warn!(error = %e, "error waiting for process");
                    None
                }
            },
            _ = kill_rx => {
                debug!("kill requested, force-killing process");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill process");
                }
                match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(error = %e, "error waiting after kill");
                        None
                    }
                }
            }
        };

        if let Some(code) = code {
            let _ = exit_code.set(code);
        }
        // Flag before notify so has_exited() is true when a waiter wakes.
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();
    }

    /// Drains a child output stream at debug level so pipes never fill up.
    async fn drain_output<R>(stream: R, label: &'static str)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(stream = label, "{}", line);
        }
    }
}

impl Default for HostTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRunner for HostTaskRunner {
    async fn launch(&self, spec: TaskSpec) -> Result<ProcessHandle, TaskError> {
        debug!(program = %spec.program, args = ?spec.args, "spawning task");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TaskError::Unavailable(format!("'{}' not found on the host", spec.program))
                } else {
                    TaskError::Spawn {
                        program: spec.program.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::drain_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::drain_output(stderr, "stderr"));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(OnceLock::new());
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            kill_rx,
            Arc::clone(&exited),
            Arc::clone(&exit_code),
            Arc::clone(&exit_notify),
        ));

        Ok(ProcessHandle::from_parts(
            pid, kill_tx, exited, exit_code, exit_notify,
        ))
    }

    async fn list_simulator_processes(&self) -> Result<Vec<HelperProcess>, TaskError> {
        // `pgrep -fl` prints "<pid> <full command line>" per match.
        let output = Command::new("pgrep")
            .args(["-fl", "CoreSimulator"])
            .output()
            .await
            .map_err(|e| TaskError::ListFailed(e.to_string()))?;

        // pgrep exits 1 when nothing matched; that's an empty sweep.
        match output.status.code() {
            Some(0) | Some(1) => {
                Ok(parse_pgrep_output(&String::from_utf8_lossy(&output.stdout)))
            }
            _ => Err(TaskError::ListFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            )),
        }
    }

    async fn kill(&self, pid: u32) -> Result<(), TaskError> {
        let output = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output()
            .await?;
        if !output.status.success() {
            return Err(TaskError::KillFailed {
                pid,
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

/// Parses `pgrep -fl` output lines into helper-process records.
fn parse_pgrep_output(output: &str) -> Vec<HelperProcess> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, cmd) = line.split_once(' ')?;
            let pid = pid.trim().parse().ok()?;
            Some(HelperProcess {
                pid,
                udid: extract_udid(cmd),
            })
        })
        .collect()
}

/// Finds the first UDID-shaped token in a command line.
///
/// Simulator helper processes carry the device UDID in an argument or a
/// path component (`.../Devices/<UDID>/...`).
fn extract_udid(cmd: &str) -> Option<String> {
    cmd.split(|c: char| c == ' ' || c == '/' || c == '=')
        .find(|token| is_udid(token))
        .map(|token| token.to_string())
}

/// True for 8-4-4-4-12 hex strings, the UDID shape simctl uses.
fn is_udid(token: &str) -> bool {
    let bytes = token.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}
