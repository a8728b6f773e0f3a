//! Docker engine access for labelled containers

use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StartContainerOptions, StopContainerOptions};
use bollard::Docker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Docker state string for a running container
pub const RUNNING: &str = "running";

/// A container as reported by the engine's list call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    /// Engine state: "running", "exited", "created", "restarting", ...
    pub state: String,
    pub labels: HashMap<String, String>,
}

impl ManagedContainer {
    pub fn is_running(&self) -> bool {
        self.state == RUNNING
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Minimal container engine surface needed by the controller
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List all containers (running or not) carrying a label under `label_prefix`
    async fn list(&self, label_prefix: &str) -> Result<Vec<ManagedContainer>>;

    /// Start a container by id
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop a container by id; `None` uses the engine's default grace period
    async fn stop(&self, id: &str, grace: Option<Duration>) -> Result<()>;
}

/// Shared engine handle
pub type SharedEngine = Arc<dyn ContainerEngine>;

/// Container engine backed by the Docker API
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the engine the controller manages containers on.
    ///
    /// `[docker] host` wins over `DOCKER_HOST`; without either the usual
    /// local sockets are probed.
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!("[docker] host = '{}' is unusable: {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "DOCKER_HOST='{}' is unusable: {}. Override it with [docker] host",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Container engine did not answer a ping: {}. \
                 Labelled containers cannot be managed until it is reachable",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("tcp endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!("expected a unix:// or tcp:// address, got '{}'", host)
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with("/.") {
                continue; // HOME unset
            }
            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "no local Docker socket found ({}). Set [docker] host or DOCKER_HOST",
                e
            )
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list(&self, label_prefix: &str) -> Result<Vec<ManagedContainer>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let summaries = self.client.list_containers(Some(options)).await?;
        let namespace = format!("{}.", label_prefix);

        let containers: Vec<ManagedContainer> = summaries
            .into_iter()
            .filter_map(|summary| {
                let labels = summary.labels.unwrap_or_default();
                if !labels.keys().any(|k| k.starts_with(&namespace)) {
                    return None;
                }
                Some(ManagedContainer {
                    id: summary.id?,
                    state: summary.state.unwrap_or_default(),
                    labels,
                })
            })
            .collect();

        debug!(count = containers.len(), label_prefix, "Listed labelled containers");
        Ok(containers)
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container_id = id, "Started Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already started");
                Ok(())
            }
            Err(e) => Err(ControllerError::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn stop(&self, id: &str, grace: Option<Duration>) -> Result<()> {
        let options = grace.map(|g| StopContainerOptions {
            t: g.as_secs() as i64,
        });

        match self.client.stop_container(id, options).await {
            Ok(_) => {
                info!(container_id = id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(ControllerError::StopFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
