//! Ephemeral Challenge Instance Manager
//!
//! Per-user, per-challenge container instances for the CyberForge CTF
//! platform: started on demand, bounded by a TTL, polled by the web client,
//! and torn down on stop or expiry.
//!
//! ## Module Structure
//!
//! - `config`: deployment knobs (TTL, port pool, limits)
//! - `store`: durable instance records (SQLite)
//! - `ports`: bounded host-port allocator
//! - `runtime`: container backends (Docker via bollard)
//! - `lifecycle`: the state machine driving provisioning and teardown
//! - `sweeper`: background expiry enforcement
//! - `auth`: bearer token validation for the gateway
//! - `server`: the client-facing polling gateway

pub mod auth;
pub mod config;
pub mod lifecycle;
pub mod ports;
pub mod runtime;
pub mod server;
pub mod store;
pub mod sweeper;

pub use auth::TokenValidator;
pub use config::{InstanceConfig, ResourceLimits};
pub use lifecycle::{InstanceError, InstanceManager, PoolStatus};
pub use ports::{PoolStats, PortAllocator};
pub use runtime::{ContainerRuntime, DockerRuntime, LaunchSpec};
pub use server::{run_server, GatewayState};
pub use store::{InstanceRecord, InstanceState, InstanceStore};
pub use sweeper::{spawn_expiry_sweeper, ExpirySweeper, SweeperConfig};
