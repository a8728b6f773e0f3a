//! Container discovery and bulk start/stop for a service
//!
//! Containers belong to a service when their `<prefix>.name` label matches the
//! service name (case-insensitive), or, failing that, when their `<prefix>.host`
//! or `<prefix>.path` label is a prefix of the caller's hint or the hint is a
//! prefix of the label.

use crate::config::LabelConfig;
use crate::docker::{ManagedContainer, SharedEngine};
use crate::error::{ControllerError, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Docker state reported while the engine restarts a container
const RESTARTING: &str = "restarting";

/// What the caller knows about the service it wants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceHints {
    pub name: String,
    pub host: Option<String>,
    pub path: Option<String>,
}

impl ServiceHints {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
            path: None,
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host.filter(|h| !h.is_empty());
        self
    }

    pub fn with_path(mut self, path: Option<String>) -> Self {
        self.path = path.filter(|p| !p.is_empty());
        self
    }
}

/// Aggregate status of a service's containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Every container is running
    Up,
    /// At least one container is stopped, created, exited, ...
    Down,
    /// The engine is restarting at least one container; none are down
    Starting,
}

impl ServiceStatus {
    /// Derive the status from a non-empty set of discovered containers
    pub fn from_containers(containers: &[ManagedContainer]) -> Self {
        let mut status = ServiceStatus::Up;
        for container in containers {
            match container.state.as_str() {
                crate::docker::RUNNING => {}
                RESTARTING => status = ServiceStatus::Starting,
                _ => return ServiceStatus::Down,
            }
        }
        status
    }
}

/// `a` starts with `b` or `b` starts with `a`
fn prefix_symmetric(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Stateless view of the engine filtered to controller-managed containers
#[derive(Clone)]
pub struct ContainerAdapter {
    engine: SharedEngine,
    labels: LabelConfig,
    stop_grace: Option<Duration>,
}

impl ContainerAdapter {
    pub fn new(engine: SharedEngine, labels: LabelConfig, stop_grace: Option<Duration>) -> Self {
        Self {
            engine,
            labels,
            stop_grace,
        }
    }

    pub fn labels(&self) -> &LabelConfig {
        &self.labels
    }

    /// Whether `container` belongs to the service described by `hints`
    pub fn matches(&self, container: &ManagedContainer, hints: &ServiceHints) -> bool {
        if let Some(name) = container.label(&self.labels.name_key()) {
            if name.to_lowercase() == hints.name.to_lowercase() {
                return true;
            }
        }

        // A declared host label decides on its own; path is only consulted
        // for containers routed by path alone.
        if let Some(label_host) = container.label(&self.labels.host_key()) {
            return hints
                .host
                .as_deref()
                .is_some_and(|host| prefix_symmetric(host, label_host));
        }

        if let Some(label_path) = container.label(&self.labels.path_key()) {
            return hints
                .path
                .as_deref()
                .is_some_and(|path| prefix_symmetric(path, label_path));
        }

        false
    }

    /// List the containers belonging to a service
    pub async fn discover(&self, hints: &ServiceHints) -> Result<Vec<ManagedContainer>> {
        let containers = self.engine.list(&self.labels.prefix).await?;

        let matched: Vec<ManagedContainer> = containers
            .into_iter()
            .filter(|c| self.matches(c, hints))
            .collect();

        if matched.is_empty() {
            return Err(ControllerError::NoMatches {
                name: hints.name.clone(),
                host: hints.host.clone().unwrap_or_default(),
                path: hints.path.clone().unwrap_or_default(),
            });
        }

        debug!(
            service = %hints.name,
            containers = ?matched.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            "Discovered service containers"
        );
        Ok(matched)
    }

    /// Start every container that is not running, stopping at the first failure
    pub async fn start_all(&self, containers: &[ManagedContainer]) -> Result<()> {
        for container in containers.iter().filter(|c| !c.is_running()) {
            info!(container_id = %container.id, state = %container.state, "Starting container");
            self.engine.start(&container.id).await.map_err(|e| {
                warn!(container_id = %container.id, error = %e, "Container start failed");
                e
            })?;
        }
        Ok(())
    }

    /// Stop every running container, stopping at the first failure
    pub async fn stop_all(&self, containers: &[ManagedContainer]) -> Result<()> {
        for container in containers.iter().filter(|c| c.is_running()) {
            info!(container_id = %container.id, "Stopping container");
            self.engine
                .stop(&container.id, self.stop_grace)
                .await
                .map_err(|e| {
                    warn!(container_id = %container.id, error = %e, "Container stop failed");
                    e
                })?;
        }
        Ok(())
    }
}
