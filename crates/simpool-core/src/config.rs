//! Configuration types for the pool, sessions, and app launches.
//!
//! [`ControlConfig`] is the process-level configuration handed to a
//! [`ControlFacade`](crate::facade::ControlFacade). It can be persisted as
//! JSON under `~/.simpool/config.json` so repeated tool invocations share the
//! same bucket and limits.
//!
//! # Example
//!
//! ```no_run
//! use simpool_core::config::{ControlConfig, SimulatorConfig};
//!
//! // Load (returns defaults if the file doesn't exist)
//! let control = ControlConfig::load();
//!
//! let sim = SimulatorConfig::new("iPhone 15", "17.0");
//! assert_eq!(sim.device_type, "iPhone 15");
//! # let _ = control;
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Returns the simpool state directory (`~/.simpool/`).
///
/// Falls back to the system temp directory when no home directory exists
/// (e.g. some CI environments).
pub fn simpool_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".simpool")
}


/// Describes the simulator a caller wants to allocate.
///
/// Matching in the pool is structural: device type, OS version, and the
/// locale override must all be equal. There is no partial or fuzzy matching;
/// a request that matches nothing provisions a new device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Human-readable device type, e.g. `"iPhone 15"`.
    pub device_type: String,
    /// OS version string, e.g. `"17.0"`.
    pub os_version: String,
    /// Optional locale override, e.g. `"de_DE"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl SimulatorConfig {
    /// Creates a configuration with no locale override.
    pub fn new(device_type: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            os_version: os_version.into(),
            locale: None,
        }
    }

    /// Sets the locale override.
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

impl std::fmt::Display for SimulatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.device_type, self.os_version)?;
        if let Some(locale) = &self.locale {
            write!(f, " [{}]", locale)?;
        }
        Ok(())
    }
}

/// Describes an application to install and launch on a session's simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLaunchConfig {
    /// The app's bundle identifier, e.g. `"com.example.app"`.
    pub bundle_id: String,
    /// Path to the built `.app` bundle. When `None`, the install step is a
    /// no-op and the app is assumed to already be present on the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_path: Option<PathBuf>,
    /// Arguments passed to the app on launch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables for the launched app.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl AppLaunchConfig {
    /// Creates a launch configuration for an already-installed app.
    pub fn new(bundle_id: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            app_path: None,
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Sets the path to the `.app` bundle to install before launching.
    pub fn with_app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.app_path = Some(path.into());
        self
    }

    /// Appends a launch argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the launched app.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Process-level configuration for a [`ControlFacade`](crate::facade::ControlFacade).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Bucket tag scoping which simulators this process may touch. Two
    /// control processes with different buckets never contend over devices.
    pub bucket: String,
    /// Maximum number of simultaneously outstanding allocations (allocated
    /// handles plus in-flight provisions).
    pub max_allocations: usize,
    /// How long `allocate` waits for a handle to free up when the pool is at
    /// capacity before reporting exhaustion.
    pub allocate_timeout: Duration,
    /// Deadline applied to individual device-runtime and task-runner calls.
    pub collaborator_timeout: Duration,
    /// Sweep orphaned simulator helper processes when the facade starts.
    #[serde(default)]
    pub kill_spurious_on_start: bool,
    /// Overrides the state directory session logs are written under.
    /// `None` uses `~/.simpool/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bucket: "default".to_string(),
            max_allocations: 4,
            allocate_timeout: Duration::from_secs(30),
            collaborator_timeout: Duration::from_secs(120),
            kill_spurious_on_start: false,
            state_dir: None,
        }
    }
}

impl ControlConfig {
    /// The effective state directory: the override, or `~/.simpool/`.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(simpool_dir)
    }

    /// The session log directory under the effective state directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn logs_dir(&self) -> PathBuf {
        let dir = self.state_dir().join("logs");
        std::fs::create_dir_all(&dir).ok();
        dir
    }

    /// Load config from `~/.simpool/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = simpool_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.simpool/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let dir = simpool_dir();
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(dir.join(CONFIG_FILENAME), json)
    }
}
