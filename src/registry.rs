//! Process-wide registry of service supervisors

use crate::adapter::{ContainerAdapter, ServiceHints};
use crate::error::{ControllerError, Result};
use crate::service::{Service, ServiceSnapshot};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maps resolved service names to their supervisor.
///
/// Records are created on the first ping that finds containers for the
/// service and live for the rest of the process. Installation goes through the map's entry API, so concurrent
/// callers for the same name always get the same `Service`.
///
/// The sentinel name is only meaningful when exactly one service matches the
/// given host/path: the first discovered container's name label wins.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
    adapter: ContainerAdapter,
    retry_backoff: Duration,
}

impl ServiceRegistry {
    pub fn new(adapter: ContainerAdapter, retry_backoff: Duration) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            adapter,
            retry_backoff,
        })
    }

    /// Return the supervisor for `hints.name`, creating it on first use.
    ///
    /// An existing record keeps the timeout and hints it was created with.
    pub async fn get_or_create(&self, hints: ServiceHints, timeout_secs: u64) -> Result<Arc<Service>> {
        let (hints, discovered) = self.resolve(hints).await?;
        let key = service_key(&hints.name);

        if let Some(existing) = self.services.get(&key) {
            let service = Arc::clone(existing.value());
            drop(existing);
            self.check_divergence(&service, &hints, timeout_secs);
            return Ok(service);
        }

        // Names without containers never get a record
        if !discovered {
            self.adapter.discover(&hints).await?;
        }

        let service = self
            .services
            .entry(key)
            .or_insert_with(|| {
                info!(
                    service = %hints.name,
                    timeout_secs,
                    host = ?hints.host,
                    path = ?hints.path,
                    "Registering service"
                );
                Service::new(
                    hints.clone(),
                    timeout_secs,
                    self.adapter.clone(),
                    self.retry_backoff,
                )
            })
            .clone();

        Ok(service)
    }

    /// Replace the sentinel name with the name label of the first matching
    /// container. The flag reports whether discovery already ran.
    async fn resolve(&self, hints: ServiceHints) -> Result<(ServiceHints, bool)> {
        if hints.name != self.adapter.labels().sentinel {
            return Ok((hints, false));
        }

        let containers = self.adapter.discover(&hints).await?;
        let name_key = self.adapter.labels().name_key();
        let resolved = containers
            .iter()
            .find_map(|c| c.label(&name_key).filter(|n| !n.is_empty()))
            .ok_or_else(|| ControllerError::NoMatches {
                name: hints.name.clone(),
                host: hints.host.clone().unwrap_or_default(),
                path: hints.path.clone().unwrap_or_default(),
            })?;

        if containers.len() > 1 {
            debug!(
                sentinel = %hints.name,
                resolved,
                candidates = containers.len(),
                "Several containers matched, using the first"
            );
        }

        Ok((
            ServiceHints {
                name: resolved.to_string(),
                ..hints
            },
            true,
        ))
    }

    fn check_divergence(&self, service: &Service, hints: &ServiceHints, timeout_secs: u64) {
        let existing = service.hints();
        if service.timeout_secs() != timeout_secs
            || existing.host != hints.host
            || existing.path != hints.path
        {
            warn!(
                service = %service.name(),
                timeout_secs = service.timeout_secs(),
                requested_timeout_secs = timeout_secs,
                host = ?existing.host,
                requested_host = ?hints.host,
                path = ?existing.path,
                requested_path = ?hints.path,
                "Ignoring new settings for an already registered service"
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .get(&service_key(name))
            .map(|s| Arc::clone(s.value()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Snapshots of every registered service, sorted by name
    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut snapshots: Vec<ServiceSnapshot> =
            self.services.iter().map(|s| s.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

/// Registry key for a service name; case-insensitive over Unicode
fn service_key(name: &str) -> String {
    name.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelConfig;
    use crate::testing::FakeEngine;

    fn registry(engine: &Arc<FakeEngine>) -> Arc<ServiceRegistry> {
        let adapter = ContainerAdapter::new(engine.clone(), LabelConfig::default(), None);
        ServiceRegistry::new(adapter, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let engine = FakeEngine::new();
        engine.add("web", "running", &[("name", "foo")]);
        let registry = registry(&engine);

        let a = registry.get_or_create(ServiceHints::new("foo"), 5).await.unwrap();
        let b = registry.get_or_create(ServiceHints::new("foo"), 5).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_record_keeps_original_settings() {
        let engine = FakeEngine::new();
        engine.add("web", "running", &[("name", "foo")]);
        let registry = registry(&engine);

        registry.get_or_create(ServiceHints::new("foo"), 5).await.unwrap();
        let again = registry
            .get_or_create(
                ServiceHints::new("foo").with_host(Some("foo.example.com".into())),
                60,
            )
            .await
            .unwrap();

        assert_eq!(again.timeout_secs(), 5);
        assert!(again.hints().host.is_none());
    }

    #[tokio::test]
    async fn test_names_are_case_insensitive() {
        let engine = FakeEngine::new();
        engine.add("web", "running", &[("name", "foo")]);
        let registry = registry(&engine);

        let a = registry.get_or_create(ServiceHints::new("Foo"), 5).await.unwrap();
        let b = registry.get_or_create(ServiceHints::new("foo"), 5).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "Foo");
        assert!(registry.get("FOO").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_is_singleton() {
        let engine = FakeEngine::new();
        engine.add("web", "running", &[("name", "foo")]);
        let registry = registry(&engine);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.get_or_create(ServiceHints::new("foo"), 5).await.unwrap()
                })
            })
            .collect();

        let services: Vec<Arc<Service>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(services.iter().all(|s| Arc::ptr_eq(s, &services[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unicode_names_are_case_insensitive() {
        let engine = FakeEngine::new();
        engine.add("web", "running", &[("name", "Ärzte")]);
        let registry = registry(&engine);

        let a = registry.get_or_create(ServiceHints::new("ärzte"), 5).await.unwrap();
        let b = registry.get_or_create(ServiceHints::new("ÄRZTE"), 5).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("Ärzte").is_some());
    }

    #[tokio::test]
    async fn test_unknown_names_create_no_records() {
        let engine = FakeEngine::new();
        let registry = registry(&engine);

        for i in 0..100 {
            let result = registry
                .get_or_create(ServiceHints::new(format!("ghost-{}", i)), 5)
                .await;
            assert!(matches!(result, Err(ControllerError::NoMatches { .. })));
        }

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_creates_no_record() {
        let engine = FakeEngine::new();
        engine.add("web", "running", &[("name", "foo")]);
        engine.fail_lists(1);
        let registry = registry(&engine);

        let result = registry.get_or_create(ServiceHints::new("foo"), 5).await;

        assert!(matches!(result, Err(ControllerError::BackendUnavailable(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_resolves_from_host_label() {
        let engine = FakeEngine::new();
        engine.add(
            "api",
            "running",
            &[("name", "realapi"), ("host", "api.example.com")],
        );
        let registry = registry(&engine);

        let service = registry
            .get_or_create(
                ServiceHints::new("generic-container-manager")
                    .with_host(Some("api.example.com".into())),
                5,
            )
            .await
            .unwrap();

        assert_eq!(service.name(), "realapi");
        assert!(registry.get("realapi").is_some());
        assert!(registry.get("generic-container-manager").is_none());
    }

    #[tokio::test]
    async fn test_sentinel_without_match_creates_nothing() {
        let engine = FakeEngine::new();
        let registry = registry(&engine);

        let result = registry
            .get_or_create(
                ServiceHints::new("generic-container-manager")
                    .with_host(Some("nothing.example.com".into())),
                5,
            )
            .await;

        assert!(matches!(result, Err(ControllerError::NoMatches { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_and_direct_name_share_record() {
        let engine = FakeEngine::new();
        engine.add(
            "api",
            "running",
            &[("name", "realapi"), ("host", "api.example.com")],
        );
        let registry = registry(&engine);

        let direct = registry.get_or_create(ServiceHints::new("realapi"), 5).await.unwrap();
        let via_sentinel = registry
            .get_or_create(
                ServiceHints::new("generic-container-manager")
                    .with_host(Some("api.example.com".into())),
                5,
            )
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&direct, &via_sentinel));
    }

    #[tokio::test]
    async fn test_snapshots_sorted() {
        let engine = FakeEngine::new();
        engine.add("z", "running", &[("name", "zeta")]);
        engine.add("a", "running", &[("name", "alpha")]);
        let registry = registry(&engine);

        registry.get_or_create(ServiceHints::new("zeta"), 5).await.unwrap();
        registry.get_or_create(ServiceHints::new("alpha"), 7).await.unwrap();

        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
