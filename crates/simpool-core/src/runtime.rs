//! Device runtime collaborator: boot, shutdown, and provision simulators.
//!
//! This module defines the [`DeviceRuntime`] trait, the seam between the
//! pool/session core and the underlying device-virtualization runtime. The
//! core only orchestrates; everything that actually touches a device goes
//! through this trait, so tests can substitute a scripted mock.
//!
//! [`SimctlRuntime`] is the shipped implementation backed by Apple's
//! `xcrun simctl` tool. Devices it creates carry the pool's bucket tag in
//! their name (`simpool-<bucket>-<device type>`), which is how
//! [`list`](DeviceRuntime::list) scopes output to one control process.
//!
//! # Requirements
//!
//! Xcode must be installed for `xcrun simctl` to be available.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::SimulatorConfig;

/// Name prefix applied to every device a pool creates or adopts.
const DEVICE_NAME_PREFIX: &str = "simpool";

/// Errors from the device runtime collaborator.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A device command failed with the given stderr output.
    #[error("device command failed: {0}")]
    CommandFailed(String),

    /// The runtime did not answer within its deadline.
    #[error("device runtime timed out")]
    Timeout,

    /// The runtime tool could not be reached at all.
    #[error("device runtime unavailable: {0}")]
    Unavailable(String),

    /// An I/O error occurred while executing a command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse JSON output from the runtime.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// One device reported by [`DeviceRuntime::list`].
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// The device's UDID.
    pub udid: String,
    /// The configuration reconstructed from the runtime's listing.
    pub config: SimulatorConfig,
    /// Whether the device is currently booted.
    pub booted: bool,
}

/// Abstract contract for the device-virtualization runtime.
///
/// All identities are UDID-like opaque strings. Implementations must be safe
/// to call from concurrent sessions; the pool never holds its table lock
/// across these calls.
#[async_trait]
pub trait DeviceRuntime: Send + Sync {
    /// Creates a new device matching `config`, named for `bucket`, and
    /// returns its UDID.
    async fn create(&self, bucket: &str, config: &SimulatorConfig) -> Result<String, RuntimeError>;

    /// Boots the device. Booting an already-booted device is not an error.
    async fn boot(&self, udid: &str) -> Result<(), RuntimeError>;

    /// Shuts the device down. Shutting down an already-shutdown device is
    /// not an error.
    async fn shutdown(&self, udid: &str) -> Result<(), RuntimeError>;

    /// Erases the device's contents and settings.
    async fn erase(&self, udid: &str) -> Result<(), RuntimeError>;

    /// Deletes the device entirely.
    async fn delete(&self, udid: &str) -> Result<(), RuntimeError>;

    /// Lists devices belonging to `bucket`.
    async fn list(&self, bucket: &str) -> Result<Vec<DiscoveredDevice>, RuntimeError>;
}

// ---------------------------------------------------------------------------
// simctl implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(rename = "deviceTypeIdentifier")]
    device_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: HashMap<String, Vec<RawDevice>>,
}

/// Device runtime backed by `xcrun simctl`.
pub struct SimctlRuntime;

impl SimctlRuntime {
    pub fn new() -> Self {
        Self
    }

    /// Runs `xcrun simctl <args>` and returns stdout on success.
    async fn simctl(args: &[&str]) -> Result<Vec<u8>, RuntimeError> {
        debug!(?args, "running simctl");
        let output = Command::new("xcrun")
            .arg("simctl")
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable("xcrun not found; is Xcode installed?".to_string())
                } else {
                    RuntimeError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(output.stdout)
    }

    /// Parses `simctl list devices -j` output into devices for `bucket`.
    ///
    /// Exposed for testing against canned JSON.
    pub fn parse_device_list(json: &[u8], bucket: &str) -> Result<Vec<DiscoveredDevice>, RuntimeError> {
        let list: DeviceList = serde_json::from_slice(json)?;
        let prefix = bucket_prefix(bucket);

        let mut devices = Vec::new();
        for (runtime_key, raw_devices) in list.devices {
            let os_version = runtime_os_version(&runtime_key);
            for raw in raw_devices {
                if !raw.name.starts_with(&prefix) {
                    continue;
                }
                let device_type = raw
                    .device_type
                    .as_deref()
                    .map(device_type_name)
                    .unwrap_or_default();
                devices.push(DiscoveredDevice {
                    udid: raw.udid,
                    booted: raw.state == "Booted",
                    config: SimulatorConfig {
                        device_type,
                        os_version: os_version.clone(),
                        locale: None,
                    },
                });
            }
        }
        Ok(devices)
    }
}

impl Default for SimctlRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the device-name prefix for a bucket, e.g. `"simpool-ci-"`.
fn bucket_prefix(bucket: &str) -> String {
    format!("{}-{}-", DEVICE_NAME_PREFIX, bucket)
}

/// Extracts an OS version from a simctl runtime key.
///
/// `com.apple.CoreSimulator.SimRuntime.iOS-17-0` becomes `"17.0"`.
fn runtime_os_version(runtime_key: &str) -> String {
    runtime_key
        .rsplit('.')
        .next()
        .and_then(|tail| tail.split_once('-'))
        .map(|(_, version)| version.replace('-', "."))
        .unwrap_or_else(|| runtime_key.to_string())
}

/// Extracts a human-readable name from a simctl device type identifier.
///
/// `com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro` becomes
/// `"iPhone 15 Pro"`.
fn device_type_name(identifier: &str) -> String {
    identifier
        .rsplit('.')
        .next()
        .unwrap_or(identifier)
        .replace('-', " ")
}

/// Builds a simctl device type identifier from a human-readable name.
fn device_type_identifier(device_type: &str) -> String {
    format!(
        "com.apple.CoreSimulator.SimDeviceType.{}",
        device_type.replace(' ', "-")
    )
}

/// Builds a simctl runtime identifier from an OS version string.
fn runtime_identifier(os_version: &str) -> String {
    format!(
        "com.apple.CoreSimulator.SimRuntime.iOS-{}",
        os_version.replace('.', "-")
    )
}

#[async_trait]
impl DeviceRuntime for SimctlRuntime {
    async fn create(&self, bucket: &str, config: &SimulatorConfig) -> Result<String, RuntimeError> {
        let name = format!("{}{}", bucket_prefix(bucket), config.device_type.replace(' ', "-"));
        let device_type = device_type_identifier(&config.device_type);
        let runtime = runtime_identifier(&config.os_version);

        let stdout = Self::simctl(&["create", &name, &device_type, &runtime]).await?;
        let udid = String::from_utf8_lossy(&stdout).trim().to_string();
        if udid.is_empty() {
            return Err(RuntimeError::CommandFailed(
                "simctl create produced no UDID".to_string(),
            ));
        }
        Ok(udid)
    }

    async fn boot(&self, udid: &str) -> Result<(), RuntimeError> {
        match Self::simctl(&["boot", udid]).await {
            Ok(_) => Ok(()),
            // Already booted is not an error.
            Err(RuntimeError::CommandFailed(stderr))
                if stderr.contains("current state: Booted") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self, udid: &str) -> Result<(), RuntimeError> {
        match Self::simctl(&["shutdown", udid]).await {
            Ok(_) => Ok(()),
            // Already shut down is not an error.
            Err(RuntimeError::CommandFailed(stderr))
                if stderr.contains("current state: Shutdown") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn erase(&self, udid: &str) -> Result<(), RuntimeError> {
        Self::simctl(&["erase", udid]).await.map(|_| ())
    }

    async fn delete(&self, udid: &str) -> Result<(), RuntimeError> {
        Self::simctl(&["delete", udid]).await.map(|_| ())
    }

    async fn list(&self, bucket: &str) -> Result<Vec<DiscoveredDevice>, RuntimeError> {
        let stdout = Self::simctl(&["list", "devices", "-j"]).await?;
        Self::parse_device_list(&stdout, bucket)
    }
}
