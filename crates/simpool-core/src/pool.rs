//! The simulator pool: allocation, freeing, reclaiming, and cleanup sweeps.
//!
//! [`SimulatorPool`] owns the set of [`ResourceHandle`]s for one bucket and
//! enforces at-most-one-owner-per-handle. The table lock covers table
//! mutation only; slow device-runtime calls (provisioning, teardown) run
//! outside it so unrelated allocations never block on a slow create.
//!
//! Invariants:
//!
//! - the set of allocated handles is always a subset of the known handles;
//! - an allocated handle's availability flag is always false;
//! - no two concurrent `allocate` calls ever receive the same handle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ControlConfig, SimulatorConfig};
use crate::error::ControlError;
use crate::runtime::{DeviceRuntime, RuntimeError};
use crate::tasks::TaskRunner;

/// The pool's record of one allocatable simulator.
///
/// A passive value object: identity plus immutable configuration. Ownership
/// and availability are tracked by the pool, not by the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    udid: Arc<str>,
    config: SimulatorConfig,
}

impl ResourceHandle {
    fn new(udid: String, config: SimulatorConfig) -> Self {
        Self {
            udid: udid.into(),
            config,
        }
    }

    /// The device's UDID-like opaque identity.
    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// The configuration the device was created or discovered with.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.udid, self.config)
    }
}

struct Entry {
    handle: ResourceHandle,
    available: bool,
    owner: Option<Uuid>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    /// Provisions in flight: counted toward the limit but not yet in
    /// `entries`.
    pending: usize,
}

impl Table {
    fn outstanding(&self) -> usize {
        self.entries.values().filter(|e| !e.available).count() + self.pending
    }
}

/// Owns and allocates the simulators of one bucket.
pub struct SimulatorPool {
    runtime: Arc<dyn DeviceRuntime>,
    tasks: Arc<dyn TaskRunner>,
    bucket: String,
    limit: usize,
    provision_timeout: Duration,
    table: Mutex<Table>,
    /// Woken whenever a handle frees up or an outstanding slot opens.
    freed: Notify,
}

impl SimulatorPool {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        tasks: Arc<dyn TaskRunner>,
        config: &ControlConfig,
    ) -> Self {
        Self {
            runtime,
            tasks,
            bucket: config.bucket.clone(),
            limit: config.max_allocations,
            provision_timeout: config.collaborator_timeout,
            table: Mutex::new(Table::default()),
            freed: Notify::new(),
        }
    }

    /// The bucket tag scoping this pool.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Adopts devices already present for this bucket as available handles.
    ///
    /// Returns the number of newly registered handles. Devices already known
    /// to the pool are left untouched.
    pub async fn discover(&self) -> Result<usize, ControlError> {
        let devices = self
            .runtime
            .list(&self.bucket)
            .await
            .map_err(ControlError::from_runtime)?;

        let mut table = self.table.lock().await;
        let mut added = 0;
        for device in devices {
            if table.entries.contains_key(&device.udid) {
                continue;
            }
            debug!(udid = %device.udid, config = %device.config, "adopting existing device");
            table.entries.insert(
                device.udid.clone(),
                Entry {
                    handle: ResourceHandle::new(device.udid, device.config),
                    available: true,
                    owner: None,
                },
            );
            added += 1;
        }
        if added > 0 {
            info!(bucket = %self.bucket, added, "discovered existing simulators");
        }
        Ok(added)
    }

    /// Allocates an idle handle matching `config`, provisioning a new device
    /// when none exists.
    ///
    /// Matching is structural equality on the full configuration; no fuzzy
    /// matching. When the outstanding-allocation limit is reached, the call
    /// waits up to `timeout` for a handle to free up and then fails with
    /// [`ControlError::PoolExhausted`]. Provisioning happens outside the
    /// table lock, with the slot reserved via a pending count so concurrent
    /// callers cannot overshoot the limit.
    pub async fn allocate(
        &self,
        config: &SimulatorConfig,
        owner: Uuid,
        timeout: Duration,
    ) -> Result<ResourceHandle, ControlError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for free notifications before probing the table so a
            // `free` landing between the probe and the wait is not missed.
            let freed = self.freed.notified();

            let outstanding = {
                let mut table = self.table.lock().await;

                if let Some(entry) = table
                    .entries
                    .values_mut()
                    .find(|e| e.available && e.handle.config() == config)
                {
                    entry.available = false;
                    entry.owner = Some(owner);
                    debug!(udid = %entry.handle.udid(), %owner, "allocated existing handle");
                    return Ok(entry.handle.clone());
                }

                let outstanding = table.outstanding();
                if outstanding < self.limit {
                    table.pending += 1;
                    None
                } else {
                    Some(outstanding)
                }
            };

            match outstanding {
                // A slot is reserved for us; provision outside the lock.
                None => return self.provision(config, owner).await,

                // At capacity: wait for a free, then retry the probe.
                Some(outstanding) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline
                        || tokio::time::timeout(deadline - now, freed).await.is_err()
                    {
                        return Err(ControlError::PoolExhausted {
                            outstanding,
                            limit: self.limit,
                        });
                    }
                }
            }
        }
    }

    /// Creates a new device for `config` and commits it to the table.
    ///
    /// The caller must have incremented the pending count; it is released
    /// here on every path.
    async fn provision(
        &self,
        config: &SimulatorConfig,
        owner: Uuid,
    ) -> Result<ResourceHandle, ControlError> {
        let created = tokio::time::timeout(
            self.provision_timeout,
            self.runtime.create(&self.bucket, config),
        )
        .await;

        let mut table = self.table.lock().await;
        table.pending -= 1;

        match created {
            Ok(Ok(udid)) => {
                let handle = ResourceHandle::new(udid.clone(), config.clone());
                table.entries.insert(
                    udid,
                    Entry {
                        handle: handle.clone(),
                        available: false,
                        owner: Some(owner),
                    },
                );
                info!(udid = %handle.udid(), config = %config, "provisioned new simulator");
                Ok(handle)
            }
            Ok(Err(source)) => {
                drop(table);
                // The reserved slot opened back up; wake a waiter.
                self.freed.notify_waiters();
                // An unreachable runtime is a collaborator problem, not a
                // provisioning one.
                Err(match source {
                    RuntimeError::Unavailable(_) => ControlError::from_runtime(source),
                    source => ControlError::ProvisioningFailed { source },
                })
            }
            Err(_) => {
                drop(table);
                self.freed.notify_waiters();
                Err(ControlError::Timeout {
                    operation: "provision simulator",
                    after: self.provision_timeout,
                })
            }
        }
    }

    /// Marks the handle available again. Does not touch the device.
    ///
    /// Freeing a handle that is not currently allocated (double free, or a
    /// handle this pool never issued) fails with [`ControlError::NotOwned`].
    pub async fn free(&self, handle: &ResourceHandle) -> Result<(), ControlError> {
        {
            let mut table = self.table.lock().await;
            let entry = table
                .entries
                .get_mut(handle.udid())
                .filter(|e| !e.available)
                .ok_or_else(|| ControlError::NotOwned {
                    udid: handle.udid().to_string(),
                })?;
            entry.available = true;
            entry.owner = None;
        }
        debug!(udid = %handle.udid(), "freed handle");
        self.freed.notify_waiters();
        Ok(())
    }

    /// Removes the handle from the known set and tears the device down
    /// (shutdown, erase, delete).
    ///
    /// Works on both allocated and free handles; an unknown handle fails
    /// with [`ControlError::NotOwned`]. The entry is removed before teardown
    /// so the handle can never be re-allocated mid-teardown; teardown errors
    /// after that point are surfaced but the removal stands.
    pub async fn reclaim(&self, handle: &ResourceHandle) -> Result<(), ControlError> {
        {
            let mut table = self.table.lock().await;
            if table.entries.remove(handle.udid()).is_none() {
                return Err(ControlError::NotOwned {
                    udid: handle.udid().to_string(),
                });
            }
        }
        // A known-set slot opened regardless of how teardown goes.
        self.freed.notify_waiters();

        let udid = handle.udid();
        if let Err(e) = self.runtime.shutdown(udid).await {
            warn!(udid, error = %e, "shutdown before erase failed");
        }
        self.runtime
            .erase(udid)
            .await
            .map_err(ControlError::from_runtime)?;
        self.runtime
            .delete(udid)
            .await
            .map_err(ControlError::from_runtime)?;
        info!(udid, "reclaimed simulator");
        Ok(())
    }

    /// Best-effort sweep of orphaned simulator helper processes.
    ///
    /// Kills helpers attributable to a known-but-unallocated device of this
    /// bucket. Helpers for allocated devices are in use; helpers whose UDID
    /// is unknown to this pool may belong to another bucket and are left
    /// alone. Failures are logged, never propagated.
    pub async fn kill_spurious_processes(&self) {
        let procs = match self.tasks.list_simulator_processes().await {
            Ok(procs) => procs,
            Err(e) => {
                warn!(error = %e, "spurious process sweep: listing failed");
                return;
            }
        };

        let (known, allocated) = {
            let table = self.table.lock().await;
            let known: HashSet<String> = table.entries.keys().cloned().collect();
            let allocated: HashSet<String> = table
                .entries
                .values()
                .filter(|e| !e.available)
                .map(|e| e.handle.udid().to_string())
                .collect();
            (known, allocated)
        };

        for proc in procs {
            let Some(udid) = &proc.udid else { continue };
            if !known.contains(udid) || allocated.contains(udid) {
                continue;
            }
            match self.tasks.kill(proc.pid).await {
                Ok(()) => info!(pid = proc.pid, udid, "killed spurious helper process"),
                Err(e) => warn!(pid = proc.pid, udid, error = %e, "failed to kill spurious helper"),
            }
        }
    }

    /// (known, available) handle counts. Primarily for tests and tooling.
    pub async fn counts(&self) -> (usize, usize) {
        let table = self.table.lock().await;
        let known = table.entries.len();
        let available = table.entries.values().filter(|e| e.available).count();
        (known, available)
    }

    /// The session currently owning `udid`, if any.
    pub async fn owner_of(&self, udid: &str) -> Option<Uuid> {
        let table = self.table.lock().await;
        table.entries.get(udid).and_then(|e| e.owner)
    }
}

impl std::fmt::Debug for SimulatorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorPool")
            .field("bucket", &self.bucket)
            .field("limit", &self.limit)
            .finish()
    }
}
