//! Expiry Sweeper Worker
//!
//! Background service that enforces instance TTLs:
//! 1. Tick every `interval_secs`
//! 2. Ask the lifecycle controller to tear down records past expiry
//! 3. Log and keep going on errors; the next tick retries
//!
//! The controller takes the same per-pair locks as client requests, so the
//! sweep never races an explicit stop into a double teardown.

use crate::lifecycle::InstanceManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Configuration for the expiry sweeper
pub struct SweeperConfig {
    /// How often to scan for expired instances (default: 1 minute)
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Background worker that removes expired instances
pub struct ExpirySweeper {
    manager: Arc<InstanceManager>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(manager: Arc<InstanceManager>, config: SweeperConfig) -> Self {
        Self { manager, config }
    }

    /// Start the sweeper (runs forever)
    pub async fn run(&self) {
        info!(
            "Expiry sweeper started (interval={}s)",
            self.config.interval_secs
        );

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));

        loop {
            ticker.tick().await;

            match self.manager.sweep_expired(Utc::now()).await {
                Ok(0) => debug!("No expired instances found"),
                Ok(n) => info!("Sweep complete, cleaned up {} expired instances", n),
                Err(e) => error!("Expiry sweep failed: {}", e),
            }
        }
    }
}

/// Start the expiry sweeper in background
pub fn spawn_expiry_sweeper(
    manager: Arc<InstanceManager>,
    config: SweeperConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sweeper = ExpirySweeper::new(manager, config);
        sweeper.run().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SweeperConfig::default();
        assert_eq!(config.interval_secs, 60);
    }
}
