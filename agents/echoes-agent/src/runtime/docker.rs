//! Docker Runtime
//!
//! Implementation of RuntimeAdapter for Docker using the bollard library.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, LogsOptions as BollardLogsOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::debug;

use crate::runtime::adapter::{ContainerInfo, LogStream, LogsOptions, RuntimeAdapter};
use crate::runtime::lines::split_lines;

/// Docker runtime adapter
pub struct DockerAdapter {
    client: Docker,
    socket_path: String,
}

impl DockerAdapter {
    /// Create a new Docker adapter connecting to the default socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_socket_defaults()
            .context("Failed to connect to Docker socket")?;

        Ok(Self {
            client,
            socket_path: "/var/run/docker.sock".to_string(),
        })
    }

    /// Create a new Docker adapter with a custom socket path
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker socket")?;

        Ok(Self {
            client,
            socket_path: socket_path.to_string(),
        })
    }

    /// Socket the adapter talks to
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Docker reports names as `/name`
    fn primary_name(names: &[String]) -> String {
        names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    fn runtime_type(&self) -> &str {
        "docker"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(error = %e, "Docker health check failed");
                Ok(false)
            }
        }
    }

    async fn version(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .map(|container| {
                let names = container.names.unwrap_or_default();
                ContainerInfo {
                    id: container.id.unwrap_or_default(),
                    name: Self::primary_name(&names),
                    names,
                    image: container.image.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn stream_logs(&self, id: &str, options: LogsOptions) -> Result<LogStream> {
        let bollard_options = BollardLogsOptions::<String> {
            stdout: options.stdout,
            stderr: options.stderr,
            follow: options.follow,
            tail: options.tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let chunks = self
            .client
            .logs(id, Some(bollard_options))
            .map(|frame| frame.map(|output| output.into_bytes()).map_err(anyhow::Error::from));

        debug!(container_id = %id, "Opened log stream");
        Ok(split_lines(Box::pin(chunks)))
    }
}
