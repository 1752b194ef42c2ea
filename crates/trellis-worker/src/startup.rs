//! Two-phase worker startup
//!
//! Phase 1 is sequential and fallible: resolve the capability set, acquire
//! and install the identity certificate. Nothing listens before it succeeds.
//! Phase 2 binds the listeners, registers with the platform and spawns the
//! heartbeat and renewal tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trellis_common::config::{vars, WorkerConfig};
use trellis_common::protocol::{WorkerRegistration, WorkerStatus};
use trellis_common::retry::RetryConfig;
use trellis_common::{AcquisitionStep, Error, Result};
use trellis_pki::CertificateStore;

use crate::certificate::{CertificateManager, CertificateSettings};
use crate::controller::{ControllerClientConfig, HttpControllerClient, DEFAULT_REQUEST_TIMEOUT};
use crate::dispatch::Dispatcher;
use crate::health::InternalHealth;
use crate::lifecycle::{Lifecycle, LifecycleSettings, StopReason, DEFAULT_DEREGISTER_TIMEOUT};
use crate::load::LoadTracker;
use crate::policy::{CallerAuthenticator, PolicyEngine};
use crate::receipt::{LogReceiptSink, ReceiptSink};
use crate::registry::ServiceRegistry;
use crate::server::{health_router, mesh_router, serve_health, serve_mesh, HealthState, Listener, MeshState};

/// Pluggable parts of a worker
pub struct WorkerOptions {
    /// Service types this binary can serve
    pub registry: ServiceRegistry,
    /// Policies requests may name
    pub policies: PolicyEngine,
    /// Where receipts go
    pub receipt_sink: Arc<dyn ReceiptSink>,
    /// Retry budget for the first certificate
    pub acquisition_retry: RetryConfig,
    /// Bound on each call to the authority or platform
    pub request_timeout: Duration,
    /// Bound on the deregistration call at shutdown
    pub deregister_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            registry: ServiceRegistry::builtin(),
            policies: PolicyEngine::builtin(),
            receipt_sink: Arc::new(LogReceiptSink),
            acquisition_retry: RetryConfig::with_max_attempts(5),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            deregister_timeout: DEFAULT_DEREGISTER_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("service_types", &self.registry.service_types())
            .field("policies", &self.policies)
            .field("acquisition_retry", &self.acquisition_retry)
            .field("request_timeout", &self.request_timeout)
            .field("deregister_timeout", &self.deregister_timeout)
            .finish()
    }
}

/// A worker that has not started yet
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    options: WorkerOptions,
}

impl Worker {
    /// Worker with the builtin registry and policies
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_options(config, WorkerOptions::default())
    }

    /// Worker with custom options
    pub fn with_options(config: WorkerConfig, options: WorkerOptions) -> Self {
        Self { config, options }
    }

    /// Run both startup phases
    ///
    /// Returns once the worker is registered and Healthy. A certificate or
    /// first-registration failure is returned as is, with every listener
    /// closed.
    pub async fn start(self) -> Result<RunningWorker> {
        let Worker { config, options } = self;
        let worker_id = config.worker_id();

        let capabilities = options
            .registry
            .get(&config.service_type)
            .cloned()
            .ok_or_else(|| {
                Error::config(
                    vars::SERVICE_TYPE,
                    format!(
                        "unknown service type '{}' (known: {})",
                        config.service_type,
                        options.registry.service_types().join(", ")
                    ),
                )
            })?;

        let store = Arc::new(
            CertificateStore::temporary()
                .map_err(|e| Error::acquisition(AcquisitionStep::Storage, e.to_string()))?,
        );
        let mut client_config = ControllerClientConfig::from_worker_config(&config);
        client_config.request_timeout = options.request_timeout;
        let client = Arc::new(HttpControllerClient::new(client_config, store.clone())?);

        let health = Arc::new(InternalHealth::new());
        let load = Arc::new(LoadTracker::new(config.max_concurrency));

        let mut cert_settings =
            CertificateSettings::new(config.service_name.clone(), config.renewal_margin);
        cert_settings.requested_sans = config.cert_sans.clone();
        cert_settings.anchor_pem = config.authority_ca_pem.clone();
        cert_settings.acquisition_retry = options.acquisition_retry;
        let certificates = Arc::new(CertificateManager::new(
            cert_settings,
            client.clone(),
            store.clone(),
            health.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            worker_id.clone(),
            capabilities,
            options.policies,
            options.receipt_sink,
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            WorkerRegistration {
                worker_id: worker_id.clone(),
                service_type: config.service_type.clone(),
                capabilities: dispatcher.capabilities(),
                endpoint: config.advertise_endpoint.clone(),
                status: WorkerStatus::Starting,
                load_score: 0.0,
                last_heartbeat_at: None,
            },
            LifecycleSettings {
                heartbeat_interval: config.heartbeat_interval,
                degraded_after_failures: config.degraded_after_failures,
                deregister_timeout: options.deregister_timeout,
            },
            client,
            load.clone(),
            health.clone(),
        ));

        // Phase 1
        let installed = match certificates.initialize_certificates().await {
            Ok(installed) => installed,
            Err(e) => {
                lifecycle.abort();
                return Err(e);
            }
        };
        lifecycle.certificate_acquired();

        // Phase 2
        let trust_chain = installed.bundle().trust_chain_pem().to_vec();
        let mesh = serve_mesh(
            config.listen_addr,
            store.clone(),
            trust_chain,
            mesh_router(MeshState {
                dispatcher,
                authenticator: Arc::new(CallerAuthenticator::new(&config.api_tokens)),
                load: load.clone(),
                lifecycle: lifecycle.clone(),
                health: health.clone(),
            }),
        )
        .await;
        let mesh = match mesh {
            Ok(listener) => listener,
            Err(e) => {
                lifecycle.abort();
                return Err(e);
            }
        };
        let probes = match serve_health(
            config.health_addr,
            health_router(HealthState {
                lifecycle: lifecycle.clone(),
                health: health.clone(),
            }),
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                lifecycle.abort();
                mesh.abort().await;
                return Err(e);
            }
        };

        if let Err(e) = lifecycle.register().await {
            error!(worker_id = %worker_id, error = %e, "Initial registration failed");
            lifecycle.abort();
            mesh.abort().await;
            probes.abort().await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let heartbeats = tokio::spawn(lifecycle.clone().run_heartbeats(cancel.clone()));
        let renewal = tokio::spawn(certificates.run_renewal(cancel.clone()));

        info!(
            worker_id = %worker_id,
            service_type = %config.service_type,
            addr = %mesh.local_addr(),
            "Worker started"
        );

        Ok(RunningWorker {
            lifecycle,
            store,
            load,
            health,
            mesh,
            probes,
            cancel,
            heartbeats: Some(heartbeats),
            renewal,
            shutdown_grace: config.shutdown_grace,
        })
    }
}

/// A started worker
pub struct RunningWorker {
    lifecycle: Arc<Lifecycle>,
    store: Arc<CertificateStore>,
    load: Arc<LoadTracker>,
    health: Arc<InternalHealth>,
    mesh: Listener,
    probes: Listener,
    cancel: CancellationToken,
    heartbeats: Option<JoinHandle<StopReason>>,
    renewal: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for RunningWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningWorker")
            .field("worker_id", &self.lifecycle.worker_id())
            .field("phase", &self.lifecycle.phase())
            .field("mesh_addr", &self.mesh.local_addr())
            .field("health_addr", &self.probes.local_addr())
            .finish()
    }
}

impl RunningWorker {
    /// Bound mTLS address
    pub fn local_addr(&self) -> SocketAddr {
        self.mesh.local_addr()
    }

    /// Bound health address
    pub fn health_addr(&self) -> SocketAddr {
        self.probes.local_addr()
    }

    /// Lifecycle of this worker
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Certificate store backing the listener
    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// In-flight request accounting
    pub fn load(&self) -> &Arc<LoadTracker> {
        &self.load
    }

    /// Self-reported issues
    pub fn health(&self) -> &Arc<InternalHealth> {
        &self.health
    }

    /// Run until a shutdown signal or a platform deregister instruction,
    /// then shut down
    pub async fn wait(mut self) -> StopReason {
        let (reason, heartbeats_done) = match self.heartbeats.as_mut() {
            Some(heartbeats) => tokio::select! {
                _ = shutdown_signal() => (StopReason::Shutdown, false),
                joined = heartbeats => {
                    let reason = finished("Heartbeat", joined).unwrap_or(StopReason::Shutdown);
                    (reason, true)
                }
            },
            None => (StopReason::Shutdown, true),
        };
        if heartbeats_done {
            self.heartbeats = None;
        }
        info!(worker_id = %self.lifecycle.worker_id(), reason = ?reason, "Stopping worker");
        self.shutdown().await;
        reason
    }

    /// Deregister, then drain in-flight requests for the grace period
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(heartbeats) = self.heartbeats {
            finished("Heartbeat", heartbeats.await);
        }
        finished("Renewal", self.renewal.await);

        self.lifecycle.deregister().await;

        let in_flight = self.load.in_flight();
        if in_flight > 0 {
            info!(in_flight, grace_secs = self.shutdown_grace.as_secs(), "Draining requests");
        }
        self.mesh.shutdown(self.shutdown_grace).await;
        self.probes.shutdown(Duration::ZERO).await;
        info!(worker_id = %self.lifecycle.worker_id(), "Worker stopped");
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Output of a joined background task; a panic or abort is logged and
/// yields `None`
fn finished<T>(task: &str, joined: std::result::Result<T, JoinError>) -> Option<T> {
    joined
        .inspect_err(|e| error!(task, error = %e, "{} task failed", task))
        .ok()
}
