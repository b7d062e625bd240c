//! Instance Manager Configuration
//!
//! Defines the deployment-level knobs for ephemeral challenge instances:
//! - Instance TTL and expiry sweep interval
//! - Port pool bounds
//! - Launch timeout and container resource limits

use serde::{Deserialize, Serialize};

/// Complete instance manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Lifetime of an instance after creation, in seconds
    pub ttl_secs: u64,
    /// How often the expiry sweeper scans, in seconds
    pub sweep_interval_secs: u64,
    /// Bound on a single runtime launch, in seconds
    pub launch_timeout_secs: u64,
    /// First host port handed out by the allocator
    pub port_base: u16,
    /// Number of ports in the pool
    pub pool_size: u16,
    /// Image name prefix; the challenge id is appended as the tag
    pub image_prefix: String,
    /// Port the challenge service listens on inside the container
    pub container_port: u16,
    /// Container resource limits
    pub limits: ResourceLimits,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600, // 1 hour per instance
            sweep_interval_secs: 60,
            launch_timeout_secs: 30,
            port_base: 30000,
            pool_size: 100,
            image_prefix: "cyberforge/challenge".to_string(),
            container_port: 22, // challenges are SSH boxes
            limits: ResourceLimits::default(),
        }
    }
}

impl InstanceConfig {
    /// Image run for a given challenge, e.g. `cyberforge/challenge:ch3`
    pub fn image_for(&self, challenge_id: i64) -> String {
        format!("{}:ch{}", self.image_prefix, challenge_id)
    }
}

/// Per-container resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit (e.g., "512m")
    pub memory_limit: String,
    /// CPU limit (1.0 = 1 CPU)
    pub cpu_limit: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit: "512m".to_string(),
            cpu_limit: 0.5,
        }
    }
}
