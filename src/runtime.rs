//! Container Runtime Backends
//!
//! The lifecycle controller drives instances through the `ContainerRuntime`
//! trait: launch a challenge container bound to a host port, tear it down by
//! name. `DockerRuntime` is the production backend; tests substitute stubs.

use anyhow::Result;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Everything the runtime needs to bring up one instance
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Unique container name; also the teardown handle
    pub container_name: String,
    /// Image to run (per-challenge tag)
    pub image: String,
    /// Host port the instance is exposed on
    pub host_port: u16,
    /// Port the service listens on inside the container
    pub container_port: u16,
    /// Login credential injected into the container
    pub credential: String,
    /// Memory limit (e.g., "512m")
    pub memory_limit: String,
    /// CPU limit (1.0 = 1 CPU)
    pub cpu_limit: f64,
}

/// Compute backend that launches and tears down challenge containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a container described by `spec`; resolves once the container
    /// is up.
    /// Returns the runtime's container id.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Tear down a container by name. Must succeed (or error harmlessly)
    /// when the container is already gone.
    async fn teardown(&self, container_name: &str) -> Result<()>;
}

/// Docker-backed runtime
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it responds
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker: {}", e))?;

        docker
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to ping Docker: {}", e))?;

        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Pull an image if not present
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Image {} already exists", image);
                return Ok(());
            }
            Err(_) => {
                info!("Pulling image: {}", image);
            }
        }

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(anyhow::anyhow!("Failed to pull image: {}", e));
                }
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let memory = parse_memory_limit(&spec.memory_limit)?;
        let nano_cpus = (spec.cpu_limit * 1_000_000_000.0) as i64;

        let exposed = format!("{}/tcp", spec.container_port);
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(exposed.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            exposed,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let container_config = Config {
            image: Some(spec.image.clone()),
            hostname: Some("challenge".to_string()),
            env: Some(vec![format!("CTF_PASSWORD={}", spec.credential)]),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                port_bindings: Some(port_bindings),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.container_name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create container: {}", e))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container: {}", e))?;

        info!(
            "Started container {} on host port {}",
            spec.container_name, spec.host_port
        );
        Ok(response.id)
    }

    async fn teardown(&self, container_name: &str) -> Result<()> {
        if let Err(e) = self.docker.stop_container(container_name, None).await {
            warn!("Failed to stop container {}: {}", container_name, e);
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(container_name, Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to remove container: {}", e))?;

        debug!("Removed container: {}", container_name);
        Ok(())
    }
}

/// Parse memory limit string (e.g., "2g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let n: i64 = num
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid memory limit"))?;
        Ok(n * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let n: i64 = num
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid memory limit"))?;
        Ok(n * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        let n: i64 = num
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid memory limit"))?;
        Ok(n * 1024)
    } else {
        limit
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid memory limit"))
    }
}
