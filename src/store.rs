//! Instance Record Store
//!
//! Durable mapping from (user, challenge) to instance state, backed by SQLite:
//! - At most one record per (user, challenge) pair (composite primary key)
//! - Atomic create-if-absent for duplicate-provisioning protection
//! - Indexed expiry scan for the background sweeper
//!
//! Only the lifecycle controller mutates records through this store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    user_id INTEGER NOT NULL,
    challenge_id INTEGER NOT NULL,
    state TEXT NOT NULL,
    port INTEGER NOT NULL,
    container_name TEXT NOT NULL UNIQUE,
    credential_hint TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, challenge_id)
);

CREATE INDEX IF NOT EXISTS idx_instances_expires ON instances(expires_at);
CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state);
"#;

/// Lifecycle state of an instance record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Requested,
    Provisioning,
    Running,
    Expiring,
    Stopped,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Running => "running",
            InstanceState::Expiring => "expiring",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(InstanceState::Requested),
            "provisioning" => Some(InstanceState::Provisioning),
            "running" => Some(InstanceState::Running),
            "expiring" => Some(InstanceState::Expiring),
            "stopped" => Some(InstanceState::Stopped),
            "failed" => Some(InstanceState::Failed),
            _ => None,
        }
    }

    /// Active states hold a port and count against the pool
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Provisioning | InstanceState::Running)
    }
}

/// One user's instance of one challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub user_id: i64,
    pub challenge_id: i64,
    pub state: InstanceState,
    pub port: u16,
    pub container_name: String,
    pub credential_hint: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct InstanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl InstanceStore {
    /// Open (or create) the store at the specified path
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        info!("Instance store initialized at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fetch the record for a (user, challenge) pair
    pub fn get(&self, user_id: i64, challenge_id: i64) -> Result<Option<InstanceRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT user_id, challenge_id, state, port, container_name, credential_hint,
                        created_at, expires_at
                 FROM instances WHERE user_id = ?1 AND challenge_id = ?2",
                params![user_id, challenge_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a record only if no record exists for the pair.
    ///
    /// Returns `true` when the record was inserted. The single INSERT under
    /// the connection lock is what keeps concurrent starts for one pair from
    /// both provisioning.
    pub fn create_if_absent(&self, record: &InstanceRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO instances
                (user_id, challenge_id, state, port, container_name, credential_hint,
                 created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.user_id,
                record.challenge_id,
                record.state.as_str(),
                record.port,
                record.container_name,
                record.credential_hint,
                record.created_at.timestamp(),
                record.expires_at.timestamp(),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Upsert a record (state transitions go through here)
    pub fn put(&self, record: &InstanceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO instances
                (user_id, challenge_id, state, port, container_name, credential_hint,
                 created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.user_id,
                record.challenge_id,
                record.state.as_str(),
                record.port,
                record.container_name,
                record.credential_hint,
                record.created_at.timestamp(),
                record.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Delete the record for a pair; returns `true` if a row was removed
    pub fn delete(&self, user_id: i64, challenge_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM instances WHERE user_id = ?1 AND challenge_id = ?2",
            params![user_id, challenge_id],
        )?;
        Ok(removed > 0)
    }

    /// Records whose expiry is at or before `now`, oldest first. Includes
    /// `expiring` rows so a teardown interrupted by a crash gets retried.
    pub fn list_expiring(&self, now: DateTime<Utc>) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, challenge_id, state, port, container_name, credential_hint,
                    created_at, expires_at
             FROM instances
             WHERE expires_at <= ?1 AND state IN ('provisioning', 'running', 'expiring')
             ORDER BY expires_at ASC",
        )?;

        let records = stmt
            .query_map(params![now.timestamp()], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Ports held by live records (used to reseed the allocator on restart).
    /// `expiring` rows still hold their port until the sweep finishes them.
    pub fn active_ports(&self) -> Result<Vec<u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT port FROM instances WHERE state IN ('provisioning', 'running', 'expiring')",
        )?;
        let ports = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<u16>, _>>()?;
        Ok(ports)
    }

    /// Number of active instances for a challenge (pool stats)
    pub fn active_count(&self, challenge_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM instances
             WHERE challenge_id = ?1 AND state IN ('provisioning', 'running')",
            params![challenge_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let state_raw: String = row.get(2)?;
    let state = InstanceState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown instance state: {state_raw}").into(),
        )
    })?;
    let created_secs: i64 = row.get(6)?;
    let expires_secs: i64 = row.get(7)?;
    Ok(InstanceRecord {
        user_id: row.get(0)?,
        challenge_id: row.get(1)?,
        state,
        port: row.get(3)?,
        container_name: row.get(4)?,
        credential_hint: row.get(5)?,
        created_at: DateTime::from_timestamp(created_secs, 0).unwrap_or(DateTime::UNIX_EPOCH),
        expires_at: DateTime::from_timestamp(expires_secs, 0).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(user_id: i64, challenge_id: i64, port: u16, ttl_secs: i64) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            user_id,
            challenge_id,
            state: InstanceState::Running,
            port,
            container_name: format!("forge-ch{challenge_id}-u{user_id}-test"),
            credential_hint: "hunter2hunter".to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn test_create_if_absent_blocks_duplicates() {
        let store = InstanceStore::in_memory().unwrap();

        let first = record(1, 7, 30000, 3600);
        assert!(store.create_if_absent(&first).unwrap());

        let mut dup = record(1, 7, 30001, 3600);
        dup.container_name = "forge-ch7-u1-other".to_string();
        assert!(!store.create_if_absent(&dup).unwrap());

        // Original record untouched
        let stored = store.get(1, 7).unwrap().unwrap();
        assert_eq!(stored.port, 30000);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = InstanceStore::in_memory().unwrap();
        store.create_if_absent(&record(1, 7, 30000, 3600)).unwrap();

        assert!(store.delete(1, 7).unwrap());
        assert!(!store.delete(1, 7).unwrap());
        assert!(store.get(1, 7).unwrap().is_none());
    }

    #[test]
    fn test_list_expiring_filters_past_expiry() {
        let store = InstanceStore::in_memory().unwrap();
        store.create_if_absent(&record(1, 1, 30000, -10)).unwrap();
        store.create_if_absent(&record(2, 1, 30001, 3600)).unwrap();

        // An interrupted teardown is picked up again
        let mut half_torn = record(3, 1, 30002, -20);
        half_torn.state = InstanceState::Expiring;
        store.create_if_absent(&half_torn).unwrap();

        let expired = store.list_expiring(Utc::now()).unwrap();
        assert_eq!(expired.len(), 2);
        // Oldest expiry first
        assert_eq!(expired[0].user_id, 3);
        assert_eq!(expired[1].user_id, 1);
    }

    #[test]
    fn test_active_ports_and_counts() {
        let store = InstanceStore::in_memory().unwrap();
        store.create_if_absent(&record(1, 1, 30000, 3600)).unwrap();
        store.create_if_absent(&record(2, 1, 30001, 3600)).unwrap();
        store.create_if_absent(&record(1, 2, 30002, 3600)).unwrap();

        let mut ports = store.active_ports().unwrap();
        ports.sort_unstable();
        assert_eq!(ports, vec![30000, 30001, 30002]);
        assert_eq!(store.active_count(1).unwrap(), 2);
        assert_eq!(store.active_count(2).unwrap(), 1);
        assert_eq!(store.active_count(9).unwrap(), 0);
    }

    #[test]
    fn test_disk_backed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.db");
        {
            let store = InstanceStore::new(path.clone()).unwrap();
            store.create_if_absent(&record(5, 3, 30042, 3600)).unwrap();
        }
        let reopened = InstanceStore::new(path).unwrap();
        let stored = reopened.get(5, 3).unwrap().unwrap();
        assert_eq!(stored.port, 30042);
        assert_eq!(stored.state, InstanceState::Running);
    }
}
