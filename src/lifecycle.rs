//! Instance Lifecycle Controller
//!
//! State machine driving per-(user, challenge) ephemeral instances:
//!
//! ```text
//! start() ──> Requested ──> Provisioning ──> Running ──> Expiring ──> Stopped
//!                               │                 │
//!                               └──> Failed       └──> Stopped (explicit stop)
//! ```
//!
//! Key invariants:
//! - At most one active (Provisioning/Running) record per pair
//! - No two active records share a port
//! - A failed or timed-out launch leaves no partial state behind
//! - Terminal states delete the record; "no record" is the resting state
//!
//! Operations on the same pair are serialized through a keyed async mutex;
//! distinct pairs never contend.

use crate::config::InstanceConfig;
use crate::ports::PortAllocator;
use crate::runtime::{ContainerRuntime, LaunchSpec};
use crate::store::{InstanceRecord, InstanceState, InstanceStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("no free ports in the pool")]
    PoolExhausted,
    #[error("no active instance for this challenge")]
    NotFound,
    #[error("provisioning failed: {0}")]
    Provision(String),
    #[error("teardown failed: {0}")]
    Teardown(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl InstanceError {
    fn storage(e: anyhow::Error) -> Self {
        InstanceError::Storage(e.to_string())
    }
}

/// Pool occupancy for one challenge
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub challenge_id: i64,
    pub pool_size: u16,
    pub assigned: i64,
    pub available: u16,
}

pub struct InstanceManager {
    config: InstanceConfig,
    store: InstanceStore,
    ports: PortAllocator,
    runtime: Arc<dyn ContainerRuntime>,
    pair_locks: DashMap<(i64, i64), Arc<Mutex<()>>>,
}

impl InstanceManager {
    /// Build a manager, reseeding the port pool with ports still held by
    /// records that survived a restart.
    pub fn new(
        config: InstanceConfig,
        store: InstanceStore,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> anyhow::Result<Self> {
        let in_use = store.active_ports()?;
        if !in_use.is_empty() {
            info!("Reseeding port pool with {} live instances", in_use.len());
        }
        let ports = PortAllocator::with_reserved(config.port_base, config.pool_size, in_use);
        Ok(Self {
            config,
            store,
            ports,
            runtime,
            pair_locks: DashMap::new(),
        })
    }

    fn pair_lock(&self, user_id: i64, challenge_id: i64) -> Arc<Mutex<()>> {
        self.pair_locks
            .entry((user_id, challenge_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start an instance for the pair, or return the live one.
    ///
    /// Duplicate-start policy: idempotent. A second start while an instance
    /// is provisioning or running returns the existing record unchanged,
    /// matching what the polling client expects on re-invocation.
    pub async fn start(
        &self,
        user_id: i64,
        challenge_id: i64,
    ) -> Result<InstanceRecord, InstanceError> {
        let lock = self.pair_lock(user_id, challenge_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        if let Some(existing) = self
            .store
            .get(user_id, challenge_id)
            .map_err(InstanceError::storage)?
        {
            if existing.state.is_active() && existing.expires_at > now {
                debug!(
                    "Returning existing instance for user {} challenge {} (port {})",
                    user_id, challenge_id, existing.port
                );
                return Ok(existing);
            }
            // Expiring, expired, or leftover terminal record: finish the
            // teardown before provisioning fresh, so stale connection info
            // is never handed back.
            self.teardown_record(&existing).await?;
        }

        let port = self.ports.reserve().ok_or(InstanceError::PoolExhausted)?;
        let suffix = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let container_name = format!("forge-ch{}-u{}-{}", challenge_id, user_id, suffix);
        let created_at = Utc::now();
        let mut record = InstanceRecord {
            user_id,
            challenge_id,
            state: InstanceState::Provisioning,
            port,
            container_name: container_name.clone(),
            credential_hint: generate_credential(),
            created_at,
            expires_at: created_at + Duration::seconds(self.config.ttl_secs as i64),
        };

        match self.store.create_if_absent(&record) {
            Ok(true) => {}
            Ok(false) => {
                // Pair lock makes this unreachable in practice; converge on
                // the record that won anyway.
                self.ports.release(port);
                return self
                    .store
                    .get(user_id, challenge_id)
                    .map_err(InstanceError::storage)?
                    .ok_or(InstanceError::NotFound);
            }
            Err(e) => {
                self.ports.release(port);
                return Err(InstanceError::storage(e));
            }
        }

        let spec = LaunchSpec {
            container_name: container_name.clone(),
            image: self.config.image_for(challenge_id),
            host_port: port,
            container_port: self.config.container_port,
            credential: record.credential_hint.clone(),
            memory_limit: self.config.limits.memory_limit.clone(),
            cpu_limit: self.config.limits.cpu_limit,
        };

        let launch_window = std::time::Duration::from_secs(self.config.launch_timeout_secs);
        match timeout(launch_window, self.runtime.launch(&spec)).await {
            Ok(Ok(_container_id)) => {
                record.state = InstanceState::Running;
                if let Err(e) = self.store.put(&record) {
                    self.rollback_partial(&record).await;
                    return Err(InstanceError::storage(e));
                }
                info!(
                    "Instance running: user {} challenge {} port {} expires {}",
                    user_id, challenge_id, port, record.expires_at
                );
                Ok(record)
            }
            Ok(Err(e)) => {
                warn!(
                    "Launch failed for {} (user {}, challenge {}): {:#}",
                    container_name, user_id, challenge_id, e
                );
                self.rollback_partial(&record).await;
                Err(InstanceError::Provision(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Launch of {} timed out after {}s",
                    container_name, self.config.launch_timeout_secs
                );
                self.rollback_partial(&record).await;
                Err(InstanceError::Provision(format!(
                    "launch timed out after {}s",
                    self.config.launch_timeout_secs
                )))
            }
        }
    }

    /// Stop the pair's instance. The second of two stop calls gets `NotFound`
    /// and triggers no second teardown.
    pub async fn stop(&self, user_id: i64, challenge_id: i64) -> Result<(), InstanceError> {
        let lock = self.pair_lock(user_id, challenge_id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .get(user_id, challenge_id)
            .map_err(InstanceError::storage)?
            .ok_or(InstanceError::NotFound)?;

        self.teardown_record(&record).await?;
        info!(
            "Instance stopped: user {} challenge {} (port {} released)",
            user_id, challenge_id, record.port
        );
        Ok(())
    }

    /// Current public view of the pair's instance. Read-only; a record at or
    /// past its expiry reports as absent even before the sweep removes it.
    pub fn status(
        &self,
        user_id: i64,
        challenge_id: i64,
    ) -> Result<Option<InstanceRecord>, InstanceError> {
        let record = self
            .store
            .get(user_id, challenge_id)
            .map_err(InstanceError::storage)?;
        Ok(record.filter(|r| r.state.is_active() && r.expires_at > Utc::now()))
    }

    /// Tear down every active record whose expiry is at or before `now`.
    /// Returns how many instances were cleaned up. Safe to run concurrently
    /// with client stop/start on the same pairs.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, InstanceError> {
        let expired = self.store.list_expiring(now).map_err(InstanceError::storage)?;
        let mut cleaned = 0;

        for record in expired {
            let lock = self.pair_lock(record.user_id, record.challenge_id);
            let _guard = lock.lock().await;

            // Re-check under the lock: a concurrent stop may have removed
            // the record, or a concurrent start may have replaced it.
            let current = self
                .store
                .get(record.user_id, record.challenge_id)
                .map_err(InstanceError::storage)?;
            // An Expiring record here is a teardown a previous process never
            // finished; sweep it the same way.
            let Some(mut current) = current else { continue };
            if current.expires_at > now {
                continue;
            }

            current.state = InstanceState::Expiring;
            self.store.put(&current).map_err(InstanceError::storage)?;

            info!(
                "Cleaning up expired instance {} (user {}, challenge {})",
                current.container_name, current.user_id, current.challenge_id
            );
            self.teardown_record(&current).await?;
            cleaned += 1;
        }

        Ok(cleaned)
    }

    /// Pool occupancy for one challenge
    pub fn pool_status(&self, challenge_id: i64) -> Result<PoolStatus, InstanceError> {
        let stats = self.ports.stats();
        let assigned = self
            .store
            .active_count(challenge_id)
            .map_err(InstanceError::storage)?;
        Ok(PoolStatus {
            challenge_id,
            pool_size: stats.pool_size,
            assigned,
            available: stats.available,
        })
    }

    /// Shared teardown path for stop, expiry, and stale-record replacement.
    /// A runtime teardown failure is logged but the record is still deleted
    /// and the port released, so no zombie entry can pin the pool.
    async fn teardown_record(&self, record: &InstanceRecord) -> Result<(), InstanceError> {
        if let Err(e) = self.runtime.teardown(&record.container_name).await {
            warn!(
                "Teardown of {} failed, dropping record anyway: {:#}",
                record.container_name, e
            );
        }
        self.store
            .delete(record.user_id, record.challenge_id)
            .map_err(InstanceError::storage)?;
        self.ports.release(record.port);
        Ok(())
    }

    /// Roll back a launch that failed or timed out: best-effort removal of
    /// whatever the runtime created, then drop the record and free the port.
    async fn rollback_partial(&self, record: &InstanceRecord) {
        if let Err(e) = self.runtime.teardown(&record.container_name).await {
            debug!(
                "Rollback teardown of {} returned {:#} (container may not exist)",
                record.container_name, e
            );
        }
        if let Err(e) = self.store.delete(record.user_id, record.challenge_id) {
            warn!("Failed to delete partial record: {:#}", e);
        }
        self.ports.release(record.port);
    }
}

/// Per-instance login credential, surfaced to the client as the
/// credential hint and injected into the container environment.
fn generate_credential() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}
