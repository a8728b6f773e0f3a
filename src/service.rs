//! Per-service activity supervisor
//!
//! Every ping reports the current status of a service and pushes its shutdown
//! deadline to `last ping + timeout`. A single timer task per service sleeps
//! until that deadline and stops the containers once a wake-up finds no new
//! activity.
//!
//! The activity channel has one slot: pings deposit the timeout with
//! `try_send` and never wait, so any number of pings inside one sleep collapse
//! into a single pending extension.
//!
//! The supervision lock is held by a ping from the status query until the
//! timer is armed, and by the timer from draining the channel until the
//! service is back to idle. Either the timer sees the ping and extends, or
//! the ping sees an idle service (with its containers already stopped) and
//! arms a fresh timer.

use crate::adapter::{ContainerAdapter, ServiceHints, ServiceStatus};
use crate::docker::ManagedContainer;
use crate::error::{ControllerError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Re-queries allowed when the engine cannot be read
const UNKNOWN_STATUS_RETRIES: u32 = 1;

/// Sleep target for timeouts too large to represent as an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `last_ping + timeout`, saturating to a far-future instant on overflow
fn shutdown_deadline(last_ping: Instant, timeout_secs: u64) -> Instant {
    last_ping
        .checked_add(Duration::from_secs(timeout_secs))
        .unwrap_or_else(|| last_ping + FAR_FUTURE)
}

/// Reply sent back to the proxy for a successful ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// All containers are running
    Started,
    /// Containers were (or are being) started
    Starting,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Started => "started",
            Reply::Starting => "starting",
        }
    }
}

/// Supervision state of a service
enum Supervision {
    /// No timer task; holds the receiving end of the activity channel
    Idle(mpsc::Receiver<u64>),
    /// A timer task owns the receiver and will stop the service when idle
    Armed,
}

/// Point-in-time view of a service for the listing endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub timeout_secs: u64,
    pub host: Option<String>,
    pub path: Option<String>,
    pub supervised: bool,
    pub pings: u64,
    pub idle_secs: u64,
}

/// Supervisor for a single service
pub struct Service {
    hints: ServiceHints,
    timeout_secs: u64,
    adapter: ContainerAdapter,
    retry_backoff: Duration,
    activity_tx: mpsc::Sender<u64>,
    supervision: Mutex<Supervision>,
    /// Mirrors `Supervision::Armed`; only written with the supervision lock held
    supervised: AtomicBool,
    last_ping: parking_lot::Mutex<Instant>,
    pings: AtomicU64,
    timers_spawned: AtomicU64,
}

impl Service {
    pub fn new(
        hints: ServiceHints,
        timeout_secs: u64,
        adapter: ContainerAdapter,
        retry_backoff: Duration,
    ) -> Arc<Self> {
        let (activity_tx, activity_rx) = mpsc::channel(1);
        Arc::new(Self {
            hints,
            timeout_secs,
            adapter,
            retry_backoff,
            activity_tx,
            supervision: Mutex::new(Supervision::Idle(activity_rx)),
            supervised: AtomicBool::new(false),
            last_ping: parking_lot::Mutex::new(Instant::now()),
            pings: AtomicU64::new(0),
            timers_spawned: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.hints.name
    }

    pub fn hints(&self) -> &ServiceHints {
        &self.hints
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Whether a timer task is currently running
    pub fn is_supervised(&self) -> bool {
        self.supervised.load(Ordering::SeqCst)
    }

    /// Number of timer tasks spawned over the lifetime of this service
    pub fn timers_spawned(&self) -> u64 {
        self.timers_spawned.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            name: self.hints.name.clone(),
            timeout_secs: self.timeout_secs,
            host: self.hints.host.clone(),
            path: self.hints.path.clone(),
            supervised: self.is_supervised(),
            pings: self.pings.load(Ordering::Relaxed),
            idle_secs: self.last_ping.lock().elapsed().as_secs(),
        }
    }

    /// Handle a ping: report the service status and keep it alive for another window
    pub async fn handle_ping(self: &Arc<Self>) -> Result<Reply> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        let mut supervision = self.supervision.lock().await;

        let (status, containers) = self.observe().await?;
        *self.last_ping.lock() = Instant::now();

        match status {
            ServiceStatus::Up => {
                debug!(service = %self.name(), "Service is up");
                self.arm(&mut supervision);
                Ok(Reply::Started)
            }
            ServiceStatus::Starting => {
                info!(service = %self.name(), "Service is starting");
                self.arm(&mut supervision);
                Ok(Reply::Starting)
            }
            ServiceStatus::Down => {
                info!(service = %self.name(), "Service is down, starting containers");
                let started = self.adapter.start_all(&containers).await;
                // Arm even after a partial start so whatever did start gets stopped
                self.arm(&mut supervision);
                started?;
                Ok(Reply::Starting)
            }
        }
    }

    /// Discover the service's containers and derive its status, re-querying
    /// a bounded number of times while the engine cannot be read
    async fn observe(&self) -> Result<(ServiceStatus, Vec<ManagedContainer>)> {
        let mut attempt = 0;
        loop {
            match self.adapter.discover(&self.hints).await {
                Ok(containers) => {
                    return Ok((ServiceStatus::from_containers(&containers), containers))
                }
                Err(ControllerError::BackendUnavailable(reason))
                    if attempt < UNKNOWN_STATUS_RETRIES =>
                {
                    attempt += 1;
                    warn!(
                        service = %self.name(),
                        status = "unknown",
                        error = %reason,
                        retry_in_ms = self.retry_backoff.as_millis() as u64,
                        "Service status unknown, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawn the timer task if idle, then deposit an extension without waiting
    fn arm(self: &Arc<Self>, supervision: &mut Supervision) {
        if let Supervision::Idle(activity) = std::mem::replace(supervision, Supervision::Armed) {
            self.supervised.store(true, Ordering::SeqCst);
            self.timers_spawned.fetch_add(1, Ordering::SeqCst);
            info!(
                service = %self.name(),
                timeout_secs = self.timeout_secs,
                "Supervising service"
            );
            let service = Arc::clone(self);
            tokio::spawn(async move { service.supervise(activity).await });
        }

        match self.activity_tx.try_send(self.timeout_secs) {
            Ok(()) => debug!(service = %self.name(), "Extension queued"),
            Err(TrySendError::Full(_)) => {
                debug!(service = %self.name(), "Extension already pending")
            }
            Err(TrySendError::Closed(_)) => {
                error!(service = %self.name(), "Activity channel closed unexpectedly")
            }
        }
    }

    /// Timer task body
    async fn supervise(self: Arc<Self>, mut activity: mpsc::Receiver<u64>) {
        let mut pending = activity.recv().await;

        loop {
            if let Some(secs) = pending.take() {
                let deadline = shutdown_deadline(*self.last_ping.lock(), secs);
                debug!(
                    service = %self.name(),
                    sleep_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Waiting for inactivity"
                );
                tokio::time::sleep_until(deadline).await;
            }

            let mut supervision = self.supervision.lock().await;
            match activity.try_recv() {
                Ok(secs) => pending = Some(secs),
                Err(_) => {
                    info!(
                        service = %self.name(),
                        timeout_secs = self.timeout_secs,
                        "No activity within timeout, stopping service"
                    );
                    if let Err(e) = self.stop_containers().await {
                        error!(service = %self.name(), error = %e, "Failed to stop service");
                    }
                    self.supervised.store(false, Ordering::SeqCst);
                    *supervision = Supervision::Idle(activity);
                    return;
                }
            }
        }
    }

    async fn stop_containers(&self) -> Result<()> {
        let containers = self.adapter.discover(&self.hints).await?;
        self.adapter.stop_all(&containers).await
    }
}
