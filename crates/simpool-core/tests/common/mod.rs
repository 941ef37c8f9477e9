//! Shared test helpers for simpool-core integration tests.
//!
//! Provides programmable mock collaborators so the pool, controller, and
//! pipeline can be exercised without a Mac, Xcode, or real devices. Mocks
//! record every call and can be scripted to fail or stall per invocation.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};

use simpool_core::config::{ControlConfig, SimulatorConfig};
use simpool_core::diagnostics::{DiagnosticsError, DiagnosticsSink};
use simpool_core::facade::ControlFacade;
use simpool_core::runtime::{DeviceRuntime, DiscoveredDevice, RuntimeError};
use simpool_core::tasks::{HelperProcess, ProcessHandle, TaskError, TaskRunner, TaskSpec};

// ---------------------------------------------------------------------------
// Device runtime mock
// ---------------------------------------------------------------------------

/// Scripted device runtime. Calls are recorded as strings; per-operation
/// scripts pop one entry per call and default to success when empty.
#[derive(Default)]
pub struct MockDeviceRuntime {
    next_udid: AtomicUsize,
    calls: Mutex<Vec<String>>,
    create_script: Mutex<VecDeque<Result<(), String>>>,
    boot_script: Mutex<VecDeque<Result<(), String>>>,
    create_delay: Mutex<Option<Duration>>,
    listed: Mutex<Vec<DiscoveredDevice>>,
    unavailable: Mutex<Option<String>>,
}

impl MockDeviceRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `create` call fails with the given message.
    pub fn fail_next_create(&self, message: &str) {
        self.create_script
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    /// The next `boot` call fails with the given message.
    pub fn fail_next_boot(&self, message: &str) {
        self.boot_script
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    /// Every `create` call sleeps this long before answering.
    pub fn delay_create(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Devices reported by `list`.
    pub fn set_existing_devices(&self, devices: Vec<DiscoveredDevice>) {
        *self.listed.lock().unwrap() = devices;
    }

    /// Every call from now on fails as if the runtime tool were missing.
    pub fn set_unavailable(&self, reason: &str) {
        *self.unavailable.lock().unwrap() = Some(reason.to_string());
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        match &*self.unavailable.lock().unwrap() {
            Some(reason) => Err(RuntimeError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    /// Every recorded call, in order, as `"<op> <udid>"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls for one operation.
    pub fn call_count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(op))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn pop(script: &Mutex<VecDeque<Result<(), String>>>) -> Result<(), RuntimeError> {
        match script.lock().unwrap().pop_front() {
            Some(Err(message)) => Err(RuntimeError::CommandFailed(message)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceRuntime for MockDeviceRuntime {
    async fn create(&self, bucket: &str, config: &SimulatorConfig) -> Result<String, RuntimeError> {
        self.record(format!("create {} {}", bucket, config));
        self.check_available()?;
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::pop(&self.create_script)?;
        let n = self.next_udid.fetch_add(1, Ordering::SeqCst);
        Ok(format!("MOCK-UDID-{:04}", n))
    }

    async fn boot(&self, udid: &str) -> Result<(), RuntimeError> {
        self.record(format!("boot {}", udid));
        Self::pop(&self.boot_script)
    }

    async fn shutdown(&self, udid: &str) -> Result<(), RuntimeError> {
        self.record(format!("shutdown {}", udid));
        Ok(())
    }

    async fn erase(&self, udid: &str) -> Result<(), RuntimeError> {
        self.record(format!("erase {}", udid));
        Ok(())
    }

    async fn delete(&self, udid: &str) -> Result<(), RuntimeError> {
        self.record(format!("delete {}", udid));
        Ok(())
    }

    async fn list(&self, _bucket: &str) -> Result<Vec<DiscoveredDevice>, RuntimeError> {
        self.record("list".to_string());
        self.check_available()?;
        Ok(self.listed.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Task runner mock
// ---------------------------------------------------------------------------

/// How one scripted `launch` call behaves.
pub enum LaunchBehavior {
    /// Spawn fails outright.
    FailSpawn(String),
    /// The process exits immediately with this code.
    Completes(i32),
    /// The process exits with this code after a delay.
    CompletesAfter(Duration, i32),
    /// The process keeps running until a kill is requested.
    Runs,
}

/// Builds a handle for a process that has already exited.
pub fn exited_handle(code: i32) -> ProcessHandle {
    let exited = Arc::new(AtomicBool::new(true));
    let exit_code = Arc::new(OnceLock::new());
    let _ = exit_code.set(code);
    let (kill_tx, _kill_rx) = oneshot::channel();
    ProcessHandle::from_parts(Some(4242), kill_tx, exited, exit_code, Arc::new(Notify::new()))
}

/// Builds a handle for a process that exits with `code` after `delay`.
pub fn delayed_handle(delay: Duration, code: i32) -> ProcessHandle {
    let exited = Arc::new(AtomicBool::new(false));
    let exit_code: Arc<OnceLock<i32>> = Arc::new(OnceLock::new());
    let exit_notify = Arc::new(Notify::new());
    let (kill_tx, _kill_rx) = oneshot::channel::<()>();

    let task_exited = Arc::clone(&exited);
    let task_code = Arc::clone(&exit_code);
    let task_notify = Arc::clone(&exit_notify);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = task_code.set(code);
        task_exited.store(true, Ordering::Release);
        task_notify.notify_waiters();
    });

    ProcessHandle::from_parts(Some(4244), kill_tx, exited, exit_code, exit_notify)
}

/// Builds a handle for a process that runs until killed.
pub fn running_handle() -> ProcessHandle {
    let exited = Arc::new(AtomicBool::new(false));
    let exit_code: Arc<OnceLock<i32>> = Arc::new(OnceLock::new());
    let exit_notify = Arc::new(Notify::new());
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    let task_exited = Arc::clone(&exited);
    let task_notify = Arc::clone(&exit_notify);
    tokio::spawn(async move {
        let _ = kill_rx.await;
        task_exited.store(true, Ordering::Release);
        task_notify.notify_waiters();
    });

    ProcessHandle::from_parts(Some(4243), kill_tx, exited, exit_code, exit_notify)
}

/// Scripted task runner recording every launch spec.
#[derive(Default)]
pub struct MockTaskRunner {
    launches: Mutex<Vec<TaskSpec>>,
    launch_script: Mutex<VecDeque<LaunchBehavior>>,
    helpers: Mutex<Vec<HelperProcess>>,
    killed: Mutex<Vec<u32>>,
    kill_fails: AtomicBool,
}

impl MockTaskRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the next `launch` call. Unscripted calls complete with exit 0.
    pub fn on_next_launch(&self, behavior: LaunchBehavior) {
        self.launch_script.lock().unwrap().push_back(behavior);
    }

    pub fn set_helpers(&self, helpers: Vec<HelperProcess>) {
        *self.helpers.lock().unwrap() = helpers;
    }

    pub fn fail_kills(&self) {
        self.kill_fails.store(true, Ordering::SeqCst);
    }

    /// Every launched spec, in order.
    pub fn launches(&self) -> Vec<TaskSpec> {
        self.launches.lock().unwrap().clone()
    }

    /// Launched command lines, flattened to `"program arg arg…"`.
    pub fn launch_lines(&self) -> Vec<String> {
        self.launches()
            .into_iter()
            .map(|spec| {
                let mut line = spec.program;
                for arg in spec.args {
                    line.push(' ');
                    line.push_str(&arg);
                }
                line
            })
            .collect()
    }

    pub fn killed_pids(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for MockTaskRunner {
    async fn launch(&self, spec: TaskSpec) -> Result<ProcessHandle, TaskError> {
        self.launches.lock().unwrap().push(spec.clone());
        match self.launch_script.lock().unwrap().pop_front() {
            Some(LaunchBehavior::FailSpawn(reason)) => Err(TaskError::Spawn {
                program: spec.program,
                reason,
            }),
            Some(LaunchBehavior::Completes(code)) => Ok(exited_handle(code)),
            Some(LaunchBehavior::CompletesAfter(delay, code)) => Ok(delayed_handle(delay, code)),
            Some(LaunchBehavior::Runs) => Ok(running_handle()),
            None => Ok(exited_handle(0)),
        }
    }

    async fn list_simulator_processes(&self) -> Result<Vec<HelperProcess>, TaskError> {
        Ok(self.helpers.lock().unwrap().clone())
    }

    async fn kill(&self, pid: u32) -> Result<(), TaskError> {
        if self.kill_fails.load(Ordering::SeqCst) {
            return Err(TaskError::KillFailed {
                pid,
                reason: "kill refused".to_string(),
            });
        }
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Diagnostics mock
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockDiagnosticsSink {
    artifacts: Mutex<HashMap<String, PathBuf>>,
    fail: AtomicBool,
    collect_count: AtomicUsize,
}

impl MockDiagnosticsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_artifacts(&self, artifacts: HashMap<String, PathBuf>) {
        *self.artifacts.lock().unwrap() = artifacts;
    }

    pub fn fail_collection(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn collect_count(&self) -> usize {
        self.collect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosticsSink for MockDiagnosticsSink {
    async fn collect(&self, _udid: &str) -> Result<HashMap<String, PathBuf>, DiagnosticsError> {
        self.collect_count.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DiagnosticsError::Collect("log directory vanished".to_string()));
        }
        Ok(self.artifacts.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

/// Opt-in test logging via `RUST_LOG`. Safe to call from every test.
fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A facade wired to fresh mocks, with handles to each mock for scripting
/// and inspection.
pub struct Fixture {
    pub facade: ControlFacade,
    pub runtime: Arc<MockDeviceRuntime>,
    pub tasks: Arc<MockTaskRunner>,
    pub diagnostics: Arc<MockDiagnosticsSink>,
    /// Temporary state directory session logs land in; removed on drop.
    pub state_dir: tempfile::TempDir,
}

/// Test configuration: short waits so exhaustion tests stay fast.
pub fn test_config(max_allocations: usize) -> ControlConfig {
    ControlConfig {
        bucket: "test".to_string(),
        max_allocations,
        allocate_timeout: Duration::from_millis(200),
        collaborator_timeout: Duration::from_secs(5),
        kill_spurious_on_start: false,
        state_dir: None,
    }
}

pub fn fixture(mut config: ControlConfig) -> Fixture {
    init_logging();
    // Keep session logs out of the real home directory.
    let state_dir = tempfile::tempdir().expect("create temp state dir");
    config.state_dir = Some(state_dir.path().to_path_buf());

    let runtime = MockDeviceRuntime::new();
    let tasks = MockTaskRunner::new();
    let diagnostics = MockDiagnosticsSink::new();
    let facade = ControlFacade::new(
        config,
        runtime.clone(),
        tasks.clone(),
        diagnostics.clone(),
    );
    Fixture {
        facade,
        runtime,
        tasks,
        diagnostics,
        state_dir,
    }
}

/// The standard config most tests use.
pub fn sim_config() -> SimulatorConfig {
    SimulatorConfig::new("iPhone 15", "17.0")
}
