//! In-memory container engine for unit tests

use crate::docker::{ContainerEngine, ManagedContainer};
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const PREFIX: &str = "traefik-container-manager";

#[derive(Default)]
struct EngineState {
    containers: Vec<ManagedContainer>,
    starts: Vec<String>,
    stops: Vec<String>,
    list_calls: usize,
    failing_lists: usize,
    failing_starts: HashSet<String>,
}

/// Records every engine call and mutates container state like Docker would
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: &str, state: &str, labels: &[(&str, &str)]) {
        let labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (format!("{}.{}", PREFIX, k), v.to_string()))
            .collect();
        self.state.lock().containers.push(ManagedContainer {
            id: id.to_string(),
            state: state.to_string(),
            labels,
        });
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.state.clone())
    }

    pub fn starts(&self) -> Vec<String> {
        self.state.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().stops.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    /// Make the next `n` list calls fail
    pub fn fail_lists(&self, n: usize) {
        self.state.lock().failing_lists = n;
    }

    pub fn fail_start(&self, id: &str) {
        self.state.lock().failing_starts.insert(id.to_string());
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list(&self, label_prefix: &str) -> Result<Vec<ManagedContainer>> {
        let mut guard = self.state.lock();
        guard.list_calls += 1;
        if guard.failing_lists > 0 {
            guard.failing_lists -= 1;
            return Err(ControllerError::BackendUnavailable(
                "connection refused".to_string(),
            ));
        }
        let namespace = format!("{}.", label_prefix);
        Ok(guard
            .containers
            .iter()
            .filter(|c| c.labels.keys().any(|k| k.starts_with(&namespace)))
            .cloned()
            .collect())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.failing_starts.contains(id) {
            return Err(ControllerError::StartFailed {
                id: id.to_string(),
                reason: "port is already allocated".to_string(),
            });
        }
        guard.starts.push(id.to_string());
        if let Some(c) = guard.containers.iter_mut().find(|c| c.id == id) {
            c.state = "running".to_string();
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Option<Duration>) -> Result<()> {
        let mut guard = self.state.lock();
        guard.stops.push(id.to_string());
        if let Some(c) = guard.containers.iter_mut().find(|c| c.id == id) {
            c.state = "exited".to_string();
        }
        Ok(())
    }
}
