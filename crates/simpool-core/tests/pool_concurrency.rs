//! Pool allocation tests: uniqueness under contention, exhaustion, reuse,
//! ownership checks, and the spurious-process sweep.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use common::{fixture, sim_config, test_config};
use simpool_core::error::ControlError;
use simpool_core::runtime::DiscoveredDevice;
use simpool_core::tasks::HelperProcess;

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_allocations_get_distinct_devices() {
    let fx = fixture(test_config(8));
    let pool = Arc::clone(fx.facade.pool());
    let config = sim_config();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            pool.allocate(&config, Uuid::new_v4(), Duration::from_secs(1))
                .await
        }));
    }

    let mut udids = HashSet::new();
    for task in handles {
        let handle = task.await.unwrap().expect("allocation should succeed");
        assert!(
            udids.insert(handle.udid().to_string()),
            "two callers received the same device"
        );
    }
    assert_eq!(udids.len(), 8);
    assert_eq!(fx.runtime.call_count("create"), 8);
}

#[tokio::test]
async fn freed_handle_is_reused_not_reprovisioned() {
    let fx = fixture(test_config(4));
    let pool = fx.facade.pool();
    let config = sim_config();

    let first = pool
        .allocate(&config, Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    let udid = first.udid().to_string();
    pool.free(&first).await.unwrap();

    let second = pool
        .allocate(&config, Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(second.udid(), udid);
    assert_eq!(fx.runtime.call_count("create"), 1);
}

#[tokio::test]
async fn exhausted_pool_reports_counts() {
    let fx = fixture(test_config(1));
    let pool = fx.facade.pool();
    let config = sim_config();

    let _held = pool
        .allocate(&config, Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();

    let err = pool
        .allocate(&config, Uuid::new_v4(), Duration::from_millis(50))
        .await
        .unwrap_err();
    match err {
        ControlError::PoolExhausted { outstanding, limit } => {
            assert_eq!(outstanding, 1);
            assert_eq!(limit, 1);
        }
        other => panic!("expected PoolExhausted, got {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn waiter_wakes_when_handle_frees() {
    let fx = fixture(test_config(1));
    let pool = Arc::clone(fx.facade.pool());
    let config = sim_config();

    let held = pool
        .allocate(&config, Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    let udid = held.udid().to_string();

    let waiter = {
        let pool = Arc::clone(&pool);
        let config = config.clone();
        tokio::spawn(async move {
            pool.allocate(&config, Uuid::new_v4(), Duration::from_secs(2))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.free(&held).await.unwrap();

    let handle = waiter.await.unwrap().expect("waiter should get the freed handle");
    assert_eq!(handle.udid(), udid);
    assert_eq!(fx.runtime.call_count("create"), 1);
}

#[tokio::test]
async fn double_free_is_rejected() {
    let fx = fixture(test_config(2));
    let pool = fx.facade.pool();

    let handle = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    pool.free(&handle).await.unwrap();

    let err = pool.free(&handle).await.unwrap_err();
    assert!(matches!(err, ControlError::NotOwned { .. }));
}

#[tokio::test]
async fn different_configs_provision_separately() {
    let fx = fixture(test_config(4));
    let pool = fx.facade.pool();

    let phone = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    pool.free(&phone).await.unwrap();

    // A free handle with a different configuration must not be handed out.
    let pad = simpool_core::config::SimulatorConfig::new("iPad Pro (12.9-inch)", "17.0");
    let allocated = pool
        .allocate(&pad, Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_ne!(allocated.udid(), phone.udid());
    assert_eq!(fx.runtime.call_count("create"), 2);
}

#[tokio::test]
async fn failed_provision_releases_the_reserved_slot() {
    let fx = fixture(test_config(1));
    let pool = fx.facade.pool();
    fx.runtime.fail_next_create("no runtime profile");

    let err = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ProvisioningFailed { .. }));

    // The pending slot must have been released or the retry would exhaust.
    let handle = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .expect("pool slot should be free after a failed provision");
    pool.free(&handle).await.unwrap();
}

#[tokio::test]
async fn unreachable_runtime_surfaces_collaborator_unavailable() {
    let fx = fixture(test_config(2));
    fx.runtime.set_unavailable("xcrun not found");

    // Discovery on start.
    let err = fx.facade.start().await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::CollaboratorUnavailable {
            name: "device runtime",
            ..
        }
    ));

    // Provisioning during allocate.
    let err = fx
        .facade
        .pool()
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::CollaboratorUnavailable {
            name: "device runtime",
            ..
        }
    ));
}

#[tokio::test]
async fn discover_adopts_existing_devices() {
    let fx = fixture(test_config(4));
    fx.runtime.set_existing_devices(vec![DiscoveredDevice {
        udid: "EXISTING-0001".to_string(),
        config: sim_config(),
        booted: false,
    }]);

    let adopted = fx.facade.pool().discover().await.unwrap();
    assert_eq!(adopted, 1);

    let handle = fx
        .facade
        .pool()
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(handle.udid(), "EXISTING-0001");
    assert_eq!(fx.runtime.call_count("create"), 0);
}

#[tokio::test]
async fn reclaim_removes_the_device_entirely() {
    let fx = fixture(test_config(2));
    let pool = fx.facade.pool();

    let handle = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    let udid = handle.udid().to_string();
    pool.reclaim(&handle).await.unwrap();

    assert!(fx.runtime.calls().contains(&format!("shutdown {udid}")));
    assert!(fx.runtime.calls().contains(&format!("delete {udid}")));

    // The next allocation provisions fresh rather than reusing it.
    let next = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_ne!(next.udid(), udid);
}

#[tokio::test]
async fn spurious_sweep_spares_allocated_devices() {
    let fx = fixture(test_config(4));
    let pool = fx.facade.pool();

    let held = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    let idle = pool
        .allocate(&sim_config(), Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap();
    let idle_udid = idle.udid().to_string();
    pool.free(&idle).await.unwrap();

    fx.tasks.set_helpers(vec![
        HelperProcess {
            pid: 100,
            udid: Some(held.udid().to_string()),
        },
        HelperProcess {
            pid: 200,
            udid: Some(idle_udid),
        },
        HelperProcess {
            pid: 300,
            udid: Some("UNKNOWN-DEVICE".to_string()),
        },
        HelperProcess { pid: 400, udid: None },
    ]);

    pool.kill_spurious_processes().await;

    // Only the helper for the known-but-unallocated device is killed.
    assert_eq!(fx.tasks.killed_pids(), vec![200]);
}
