//! Instance Gateway Server
//!
//! Runs the ephemeral instance manager as a standalone HTTP server behind
//! the CTF platform front-end.

use anyhow::Result;
use clap::Parser;
use forge_instance::{
    spawn_expiry_sweeper, GatewayState, InstanceConfig, InstanceManager, InstanceStore,
    DockerRuntime, SweeperConfig, TokenValidator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "instance-server")]
#[command(about = "Ephemeral challenge instance gateway")]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8080", env = "INSTANCE_PORT")]
    port: u16,

    /// Server host
    #[arg(long, default_value = "0.0.0.0", env = "INSTANCE_HOST")]
    host: String,

    /// Data directory
    #[arg(short, long, default_value = "/data", env = "DATA_DIR")]
    data_dir: PathBuf,

    /// Shared secret for validating access tokens
    #[arg(long, env = "JWT_SECRET", default_value = "dev-insecure-change-me")]
    jwt_secret: String,

    /// Instance TTL in seconds
    #[arg(long, default_value = "3600", env = "INSTANCE_TTL_SECS")]
    ttl_secs: u64,

    /// First host port handed out to instances
    #[arg(long, default_value = "30000", env = "INSTANCE_PORT_BASE")]
    port_base: u16,

    /// Number of ports in the pool
    #[arg(long, default_value = "100", env = "INSTANCE_POOL_SIZE")]
    pool_size: u16,

    /// Image name prefix for challenge containers
    #[arg(long, default_value = "cyberforge/challenge", env = "INSTANCE_IMAGE_PREFIX")]
    image_prefix: String,

    /// Expiry sweep interval in seconds
    #[arg(long, default_value = "60", env = "SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forge_instance=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("Starting instance gateway");
    info!("  Data dir: {:?}", args.data_dir);
    info!("  Port pool: {} + {}", args.port_base, args.pool_size);
    info!("  Instance TTL: {}s", args.ttl_secs);
    info!("  Listening on: {}:{}", args.host, args.port);

    let config = InstanceConfig {
        ttl_secs: args.ttl_secs,
        sweep_interval_secs: args.sweep_interval_secs,
        port_base: args.port_base,
        pool_size: args.pool_size,
        image_prefix: args.image_prefix,
        ..Default::default()
    };

    let store = InstanceStore::new(args.data_dir.join("instances.db"))?;
    let runtime = Arc::new(DockerRuntime::connect().await?);
    let manager = Arc::new(InstanceManager::new(config.clone(), store, runtime)?);

    spawn_expiry_sweeper(
        Arc::clone(&manager),
        SweeperConfig {
            interval_secs: config.sweep_interval_secs,
        },
    );

    let state = Arc::new(GatewayState {
        manager,
        auth: TokenValidator::new(args.jwt_secret.as_bytes()),
    });

    info!("Instance gateway ready");

    // Serve (blocks until shutdown)
    forge_instance::run_server(state, &args.host, args.port).await?;

    Ok(())
}
