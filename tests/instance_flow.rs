//! End-to-end instance lifecycle scenarios over the public API,
//! with a stub container runtime in place of Docker.

use async_trait::async_trait;
use chrono::Utc;
use forge_instance::{
    ContainerRuntime, InstanceConfig, InstanceError, InstanceManager, InstanceStore, LaunchSpec,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct StubRuntime {
    launches: AtomicUsize,
    teardowns: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<String> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(format!("id-{}", spec.container_name))
    }

    async fn teardown(&self, _container_name: &str) -> anyhow::Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn manager(runtime: Arc<StubRuntime>, config: InstanceConfig) -> Arc<InstanceManager> {
    let store = InstanceStore::in_memory().unwrap();
    Arc::new(InstanceManager::new(config, store, runtime).unwrap())
}

/// User A starts challenge 7, gets a port and a one-hour expiry. A concurrent
/// duplicate start returns the same record. After stop, status reports absent
/// and the port goes to the next start.
#[tokio::test]
async fn full_session_lifecycle() {
    let runtime = Arc::new(StubRuntime::default());
    let config = InstanceConfig {
        port_base: 10042,
        pool_size: 10,
        ..Default::default()
    };
    let mgr = manager(runtime.clone(), config);

    let started = mgr.start(1, 7).await.unwrap();
    assert_eq!(started.port, 10042);
    let remaining = (started.expires_at - Utc::now()).num_seconds();
    assert!((3590..=3600).contains(&remaining));

    // Duplicate start for the same pair: same record, no second launch
    let duplicate = mgr.start(1, 7).await.unwrap();
    assert_eq!(duplicate.port, 10042);
    assert_eq!(duplicate.container_name, started.container_name);
    assert_eq!(runtime.launches.load(Ordering::SeqCst), 1);

    // Another user gets their own instance on a different port
    let other = mgr.start(2, 7).await.unwrap();
    assert_ne!(other.port, started.port);

    mgr.stop(1, 7).await.unwrap();
    assert!(mgr.status(1, 7).unwrap().is_none());
    // User B is untouched
    assert!(mgr.status(2, 7).unwrap().is_some());

    // Port 10042 is free again for the next start
    let reused = mgr.start(3, 5).await.unwrap();
    assert_eq!(reused.port, 10042);
}

/// Many concurrent starts for one pair collapse to a single provisioned
/// instance; concurrent starts across pairs never share a port.
#[tokio::test]
async fn concurrent_starts_hold_invariants() {
    let runtime = Arc::new(StubRuntime::default());
    let config = InstanceConfig {
        pool_size: 32,
        ..Default::default()
    };
    let mgr = manager(runtime.clone(), config);

    let mut handles = Vec::new();
    for user_id in 1..=4 {
        for _ in 0..4 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(
                async move { mgr.start(user_id, 7).await },
            ));
        }
    }

    let mut ports = Vec::new();
    for handle in handles {
        ports.push(handle.await.unwrap().unwrap().port);
    }
    ports.sort_unstable();
    ports.dedup();

    // 4 users x 4 duplicate starts -> exactly 4 instances, 4 distinct ports
    assert_eq!(ports.len(), 4);
    assert_eq!(runtime.launches.load(Ordering::SeqCst), 4);
}

/// Pool exhaustion surfaces as a typed error and leaves nothing behind.
#[tokio::test]
async fn exhausted_pool_rejects_cleanly() {
    let runtime = Arc::new(StubRuntime::default());
    let config = InstanceConfig {
        pool_size: 2,
        ..Default::default()
    };
    let mgr = manager(runtime.clone(), config);

    mgr.start(1, 1).await.unwrap();
    mgr.start(2, 1).await.unwrap();

    let err = mgr.start(3, 1).await.unwrap_err();
    assert!(matches!(err, InstanceError::PoolExhausted));
    assert!(mgr.status(3, 1).unwrap().is_none());

    // Freeing one slot unblocks the waiter's retry
    mgr.stop(1, 1).await.unwrap();
    assert!(mgr.start(3, 1).await.is_ok());
}

/// Expired instances are removed by the sweep and their ports recycled;
/// an explicit stop racing the sweep converges without a double teardown.
#[tokio::test]
async fn sweep_enforces_expiry() {
    let runtime = Arc::new(StubRuntime::default());
    let config = InstanceConfig {
        ttl_secs: 0,
        pool_size: 4,
        ..Default::default()
    };
    let mgr = manager(runtime.clone(), config);

    mgr.start(1, 1).await.unwrap();
    mgr.start(2, 1).await.unwrap();

    let cleaned = mgr.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(cleaned, 2);
    assert_eq!(runtime.teardowns.load(Ordering::SeqCst), 2);

    // Records are gone; stop now reports NotFound, with no extra teardown
    assert!(matches!(
        mgr.stop(1, 1).await,
        Err(InstanceError::NotFound)
    ));
    assert_eq!(runtime.teardowns.load(Ordering::SeqCst), 2);

    // The pool drained back to empty
    let stats = mgr.pool_status(1).unwrap();
    assert_eq!(stats.assigned, 0);
    assert_eq!(stats.available, 4);
}
