//! Worker lifecycle state machine
//!
//! ```text
//! Starting -> CertificateAcquired -> Registering -> Healthy <-> Degraded
//!                                                       \          /
//!                                                      Deregistering -> Stopped
//! ```
//!
//! The phase is published on a watch channel. Heartbeats run on a fixed
//! cadence in their own task, independent of request handling; the load
//! score is read from the [`LoadTracker`] at each tick.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_common::protocol::{
    codes, Ack, HeartbeatAction, HeartbeatRequest, WorkerRegistration, WorkerStatus,
};
use trellis_common::{Error, Result};

use crate::controller::ControllerClient;
use crate::health::InternalHealth;
use crate::load::LoadTracker;

/// Default bound on the deregistration call at shutdown
pub const DEFAULT_DEREGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle phase of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// Process started, no certificate yet
    Starting,
    /// Identity certificate installed
    CertificateAcquired,
    /// Registering with the platform
    Registering,
    /// Registered and heartbeating
    Healthy,
    /// Serving, but heartbeats fail or an internal issue is outstanding
    Degraded,
    /// Shutting down, deregistration in progress
    Deregistering,
    /// Terminal
    Stopped,
}

impl WorkerPhase {
    /// Phase name as used in logs and health responses
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::CertificateAcquired => "certificate_acquired",
            Self::Registering => "registering",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Deregistering => "deregistering",
            Self::Stopped => "stopped",
        }
    }

    /// Whether requests are being served
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Status reported to the platform
    pub fn status(&self) -> WorkerStatus {
        match self {
            Self::Healthy => WorkerStatus::Healthy,
            Self::Degraded => WorkerStatus::Degraded,
            Self::Deregistering | Self::Stopped => WorkerStatus::Deregistered,
            Self::Starting | Self::CertificateAcquired | Self::Registering => {
                WorkerStatus::Starting
            }
        }
    }

    /// Whether moving to `to` is a legal transition
    pub fn can_transition_to(&self, to: WorkerPhase) -> bool {
        use WorkerPhase::*;
        match (self, to) {
            (Starting, CertificateAcquired)
            | (CertificateAcquired, Registering)
            | (Registering, Healthy)
            | (Healthy, Degraded)
            | (Degraded, Healthy) => true,
            (Stopped, _) | (Deregistering, Deregistering) => false,
            (Deregistering, Stopped) => true,
            (_, Deregistering) | (_, Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the heartbeat loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Local shutdown was requested
    Shutdown,
    /// The platform told the worker to deregister
    PlatformInstruction,
}

/// Result of a single heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Accepted
    Acknowledged,
    /// Failed; carries the consecutive failure count
    Failed(u32),
    /// The platform asked the worker to leave
    Deregister,
}

/// Lifecycle timing settings
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures before Degraded
    pub degraded_after_failures: u32,
    /// Bound on the deregistration call
    pub deregister_timeout: Duration,
}

/// Coordinates registration, heartbeats and deregistration
pub struct Lifecycle {
    registration: WorkerRegistration,
    settings: LifecycleSettings,
    controller: Arc<dyn ControllerClient>,
    load: Arc<LoadTracker>,
    health: Arc<InternalHealth>,
    phase: watch::Sender<WorkerPhase>,
    consecutive_failures: AtomicU32,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("worker_id", &self.registration.worker_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Lifecycle {
    /// Lifecycle for the worker described by `registration`
    pub fn new(
        registration: WorkerRegistration,
        settings: LifecycleSettings,
        controller: Arc<dyn ControllerClient>,
        load: Arc<LoadTracker>,
        health: Arc<InternalHealth>,
    ) -> Self {
        let (phase, _) = watch::channel(WorkerPhase::Starting);
        Self {
            registration,
            settings,
            controller,
            load,
            health,
            phase,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Worker id
    pub fn worker_id(&self) -> &str {
        &self.registration.worker_id
    }

    /// Current phase
    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    /// Phase updates
    pub fn subscribe(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    /// Consecutive failed heartbeats
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Move to `to` if legal; returns whether the phase changed
    fn transition(&self, to: WorkerPhase) -> bool {
        self.phase.send_if_modified(|current| {
            if current.can_transition_to(to) {
                info!(
                    worker_id = %self.registration.worker_id,
                    from = %current,
                    to = %to,
                    "Worker phase transition"
                );
                *current = to;
                true
            } else {
                if *current != to {
                    debug!(from = %current, to = %to, "Ignoring invalid phase transition");
                }
                false
            }
        })
    }

    /// Record that the identity certificate is installed
    pub fn certificate_acquired(&self) {
        self.transition(WorkerPhase::CertificateAcquired);
    }

    /// First registration; failure is fatal to startup
    pub async fn register(&self) -> Result<Ack> {
        self.transition(WorkerPhase::Registering);
        let ack = self.controller.register(&self.snapshot()).await?;
        self.transition(WorkerPhase::Healthy);
        self.refresh_health();
        Ok(ack)
    }

    fn snapshot(&self) -> WorkerRegistration {
        let mut registration = self.registration.clone();
        registration.status = self.reported_status();
        registration.load_score = self.load.score();
        registration
    }

    fn reported_status(&self) -> WorkerStatus {
        let phase = self.phase();
        if phase.is_serving() && self.health.is_degraded() {
            WorkerStatus::Degraded
        } else {
            phase.status()
        }
    }

    /// Apply self-reported health to a serving phase
    pub fn refresh_health(&self) {
        let failing = self.consecutive_failures() >= self.settings.degraded_after_failures;
        match self.phase() {
            WorkerPhase::Healthy if failing || self.health.is_degraded() => {
                self.transition(WorkerPhase::Degraded);
            }
            WorkerPhase::Degraded if !failing && !self.health.is_degraded() => {
                self.transition(WorkerPhase::Healthy);
            }
            _ => {}
        }
    }

    /// Bound a platform call by the heartbeat interval so ticks are never held up
    async fn within_interval<T>(
        &self,
        operation: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.settings.heartbeat_interval, call)
            .await
            .unwrap_or_else(|_| {
                Err(Error::controller_unavailable(
                    operation,
                    "no response within heartbeat interval",
                ))
            })
    }

    /// Send one heartbeat and apply the outcome
    pub async fn heartbeat_once(&self) -> HeartbeatOutcome {
        let request = HeartbeatRequest {
            worker_id: self.registration.worker_id.clone(),
            status: self.reported_status(),
            load_score: self.load.score(),
            timestamp: Utc::now(),
        };

        let result = self
            .within_interval("heartbeat", self.controller.heartbeat(&request))
            .await;

        let result = match result {
            Err(Error::Registration { code, .. }) if code == codes::UNKNOWN_WORKER => {
                warn!(
                    worker_id = %self.registration.worker_id,
                    "Platform does not know this worker; registering again"
                );
                let snapshot = self.snapshot();
                self.within_interval("register", self.controller.register(&snapshot))
                    .await
                    .map(|_| None)
            }
            other => other.map(|response| Some(response.action)),
        };

        match result {
            Ok(action) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.refresh_health();
                if action == Some(HeartbeatAction::Deregister) {
                    info!(
                        worker_id = %self.registration.worker_id,
                        "Platform instructed deregistration"
                    );
                    return HeartbeatOutcome::Deregister;
                }
                debug!(worker_id = %self.registration.worker_id, "Heartbeat acknowledged");
                HeartbeatOutcome::Acknowledged
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    worker_id = %self.registration.worker_id,
                    error = %e,
                    consecutive_failures = failures,
                    "Heartbeat failed"
                );
                self.refresh_health();
                HeartbeatOutcome::Failed(failures)
            }
        }
    }

    /// Heartbeat on a fixed cadence until cancelled or told to deregister
    pub async fn run_heartbeats(self: Arc<Self>, cancel: CancellationToken) -> StopReason {
        let period = self.settings.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StopReason::Shutdown,
                _ = ticker.tick() => {}
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return StopReason::Shutdown,
                outcome = self.heartbeat_once() => outcome,
            };
            if outcome == HeartbeatOutcome::Deregister {
                return StopReason::PlatformInstruction;
            }
        }
    }

    /// Best-effort deregistration, then Stopped regardless of the outcome
    ///
    /// Calling it again after the worker has stopped does nothing.
    pub async fn deregister(&self) {
        if !self.transition(WorkerPhase::Deregistering) {
            return;
        }
        let worker_id = self.registration.worker_id.as_str();
        match tokio::time::timeout(
            self.settings.deregister_timeout,
            self.controller.deregister(worker_id),
        )
        .await
        {
            Ok(Ok(_)) => info!(worker_id = %worker_id, "Deregistered"),
            Ok(Err(e)) => warn!(worker_id = %worker_id, error = %e, "Deregistration failed"),
            Err(_) => warn!(worker_id = %worker_id, "Deregistration timed out"),
        }
        self.transition(WorkerPhase::Stopped);
    }

    /// Stop without contacting the platform (startup abort)
    pub fn abort(&self) {
        self.transition(WorkerPhase::Stopped);
    }
}
