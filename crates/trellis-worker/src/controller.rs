//! Client for the authority and platform endpoints
//!
//! CSR submission goes over the bootstrap channel: server-authenticated TLS
//! (trusting the pre-provisioned root CA when one is configured) plus the
//! bootstrap token as a bearer credential. Registration, heartbeat and
//! deregistration go over mutual TLS using the identity currently installed in
//! the [`CertificateStore`]. The mTLS client is rebuilt whenever the store's
//! generation changes, so renewed certificates are presented on the next call.
//!
//! Every call has a bounded timeout and passes through a per-endpoint
//! [`CircuitBreaker`]. Transport failures and 5xx responses surface as
//! [`Error::ControllerUnavailable`]; structured 4xx rejections surface as
//! [`Error::Registration`] carrying the platform's error code.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use trellis_common::config::WorkerConfig;
use trellis_common::protocol::{
    heartbeat_path, worker_path, Ack, CsrRequest, CsrResponse, ErrorBody, HeartbeatRequest,
    HeartbeatResponse, WorkerRegistration, CSR_PATH, WORKERS_PATH,
};
use trellis_common::retry::{
    retry_with_backoff_when, CircuitBreaker, RetryConfig, DEFAULT_COOLDOWN,
    DEFAULT_FAILURE_THRESHOLD,
};
use trellis_common::{AcquisitionStep, Error, Result};
use trellis_pki::{CertificateBundle, CertificateStore};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP/TLS connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Submits CSRs to the authority
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrSubmitter: Send + Sync {
    /// Submit a CSR and return the signed certificate and CA chain
    ///
    /// Errors are [`Error::CertificateAcquisition`] at step `Submission`
    /// (transport, retryable) or `Rejected` (the authority said no).
    async fn submit_csr(&self, request: &CsrRequest) -> Result<CsrResponse>;
}

/// Platform registry operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Register the worker and its capabilities
    async fn register(&self, registration: &WorkerRegistration) -> Result<Ack>;

    /// Report liveness, status and load
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse>;

    /// Remove the worker from routing; unknown workers are acknowledged
    async fn deregister(&self, worker_id: &str) -> Result<Ack>;
}

/// Settings for [`HttpControllerClient`]
#[derive(Clone)]
pub struct ControllerClientConfig {
    /// Base URL of the authority/platform
    pub base_url: String,
    /// Bearer credential for CSR submission
    pub bootstrap_token: Zeroizing<String>,
    /// Pre-provisioned root CA for the bootstrap channel
    pub authority_ca_pem: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry policy for registration
    pub registration_retry: RetryConfig,
    /// Consecutive failures before a breaker opens
    pub breaker_threshold: u32,
    /// How long an open breaker rejects calls
    pub breaker_cooldown: Duration,
}

impl std::fmt::Debug for ControllerClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerClientConfig")
            .field("base_url", &self.base_url)
            .field("bootstrap_token", &"[REDACTED]")
            .field("authority_ca_pem", &self.authority_ca_pem.is_some())
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("registration_retry", &self.registration_retry)
            .field("breaker_threshold", &self.breaker_threshold)
            .field("breaker_cooldown", &self.breaker_cooldown)
            .finish()
    }
}

impl ControllerClientConfig {
    /// Settings with defaults for everything but the endpoint and credentials
    pub fn new(base_url: impl Into<String>, bootstrap_token: Zeroizing<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bootstrap_token,
            authority_ca_pem: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            registration_retry: RetryConfig::with_max_attempts(3),
            breaker_threshold: DEFAULT_FAILURE_THRESHOLD,
            breaker_cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Settings derived from worker configuration
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        let mut settings = Self::new(config.authority_url.clone(), config.bootstrap_token.clone());
        settings.authority_ca_pem = config.authority_ca_pem.clone();
        settings
    }
}

struct CachedClient {
    generation: u64,
    client: reqwest::Client,
}

/// HTTPS implementation of [`CsrSubmitter`] and [`ControllerClient`]
pub struct HttpControllerClient {
    config: ControllerClientConfig,
    store: Arc<CertificateStore>,
    bootstrap: reqwest::Client,
    mtls: Mutex<Option<CachedClient>>,
    authority_breaker: CircuitBreaker,
    platform_breaker: CircuitBreaker,
}

impl std::fmt::Debug for HttpControllerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControllerClient")
            .field("config", &self.config)
            .field("authority_breaker", &self.authority_breaker.state())
            .field("platform_breaker", &self.platform_breaker.state())
            .finish()
    }
}

impl HttpControllerClient {
    /// Build the client; fails if the configured root CA is unusable
    pub fn new(config: ControllerClientConfig, store: Arc<CertificateStore>) -> Result<Self> {
        let bootstrap = build_http_client(&config, None)?;
        Ok(Self {
            authority_breaker: CircuitBreaker::with_settings(
                "authority",
                config.breaker_threshold,
                config.breaker_cooldown,
            ),
            platform_breaker: CircuitBreaker::with_settings(
                "platform",
                config.breaker_threshold,
                config.breaker_cooldown,
            ),
            config,
            store,
            bootstrap,
            mtls: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Client presenting the currently installed identity
    fn mtls_client(&self) -> Result<reqwest::Client> {
        let installed = self
            .store
            .current()
            .ok_or_else(|| Error::tls("no certificate installed for mutual TLS"))?;
        let generation = installed.generation();

        let mut cached = self.mtls.lock();
        if let Some(entry) = cached.as_ref() {
            if entry.generation == generation {
                return Ok(entry.client.clone());
            }
        }

        let client = build_http_client(&self.config, Some(installed.bundle()))?;
        debug!(generation = generation, "Built mTLS client for installed certificate");
        *cached = Some(CachedClient {
            generation,
            client: client.clone(),
        });
        Ok(client)
    }

    /// Run one call through a breaker, recording the outcome
    async fn guarded<T, F>(&self, breaker: &CircuitBreaker, operation: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if !breaker.allow() {
            return Err(Error::controller_unavailable(
                operation,
                "circuit open after repeated failures",
            ));
        }
        let result = call.await;
        match &result {
            Err(Error::ControllerUnavailable { .. }) => breaker.record_failure(),
            // The endpoint answered, even if it refused
            _ => breaker.record_success(),
        }
        result
    }

    async fn register_once(&self, registration: &WorkerRegistration) -> Result<Ack> {
        let client = self.mtls_client()?;
        self.guarded(&self.platform_breaker, "register", async {
            let response = client
                .post(self.url(WORKERS_PATH))
                .json(registration)
                .send()
                .await
                .map_err(|e| transport_error("register", e))?;
            decode("register", response).await
        })
        .await
    }
}

#[async_trait]
impl CsrSubmitter for HttpControllerClient {
    async fn submit_csr(&self, request: &CsrRequest) -> Result<CsrResponse> {
        let result = self
            .guarded(&self.authority_breaker, "submit_csr", async {
                let response = self
                    .bootstrap
                    .post(self.url(CSR_PATH))
                    .bearer_auth(self.config.bootstrap_token.as_str())
                    .json(request)
                    .send()
                    .await
                    .map_err(|e| transport_error("submit_csr", e))?;
                decode::<CsrResponse>("submit_csr", response).await
            })
            .await;

        result.map_err(|e| match e {
            Error::ControllerUnavailable { message, .. } => {
                Error::acquisition(AcquisitionStep::Submission, message)
            }
            Error::Registration { code, message, .. } => Error::acquisition(
                AcquisitionStep::Rejected,
                format!("{}: {}", code, message),
            ),
            other => Error::acquisition(AcquisitionStep::Rejected, other.to_string()),
        })
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn register(&self, registration: &WorkerRegistration) -> Result<Ack> {
        let ack = retry_with_backoff_when(
            &self.config.registration_retry,
            "register",
            || self.register_once(registration),
            |e: &Error| matches!(e, Error::ControllerUnavailable { .. }),
        )
        .await?;
        info!(worker_id = %ack.worker_id, "Registration acknowledged");
        Ok(ack)
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let client = self.mtls_client()?;
        self.guarded(&self.platform_breaker, "heartbeat", async {
            let response = client
                .post(self.url(&heartbeat_path(&request.worker_id)))
                .json(request)
                .send()
                .await
                .map_err(|e| transport_error("heartbeat", e))?;
            decode("heartbeat", response).await
        })
        .await
    }

    async fn deregister(&self, worker_id: &str) -> Result<Ack> {
        let client = self.mtls_client()?;
        self.guarded(&self.platform_breaker, "deregister", async {
            let response = client
                .delete(self.url(&worker_path(worker_id)))
                .send()
                .await
                .map_err(|e| transport_error("deregister", e))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Ack {
                    worker_id: worker_id.to_string(),
                });
            }
            decode("deregister", response).await
        })
        .await
    }
}

fn build_http_client(
    config: &ControllerClientConfig,
    identity: Option<&CertificateBundle>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .https_only(config.base_url.starts_with("https://"))
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout);

    let mut anchors: Vec<&str> = Vec::new();
    if let Some(ca) = &config.authority_ca_pem {
        anchors.push(ca);
    }
    if let Some(bundle) = identity {
        anchors.extend(bundle.trust_chain_pem().iter().map(String::as_str));
        let identity = reqwest::Identity::from_pem(bundle.identity_pem().as_bytes())
            .map_err(|e| Error::tls(format!("invalid client identity: {}", e)))?;
        builder = builder.identity(identity);
    }

    if !anchors.is_empty() {
        builder = builder.tls_built_in_root_certs(false);
    }
    for pem in anchors {
        let cert = reqwest::Certificate::from_pem(pem.as_bytes())
            .map_err(|e| Error::tls(format!("invalid CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(cert);
    }

    builder
        .build()
        .map_err(|e| Error::tls(format!("failed to build HTTP client: {}", e)))
}

fn transport_error(operation: &str, e: reqwest::Error) -> Error {
    let message = if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    };
    warn!(operation = %operation, error = %message, "Controller request failed");
    Error::controller_unavailable(operation, message)
}

/// Turn a response into a value or a structured error
async fn decode<T: DeserializeOwned>(operation: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| Error::serialization(format!("invalid {} response: {}", operation, e)));
    }

    let body = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
    if status.is_client_error() {
        let (code, message) = match parsed {
            Some(err) => (err.error, err.message),
            None => (status.as_u16().to_string(), body),
        };
        return Err(Error::registration(operation, code, message));
    }

    let message = parsed.map(|err| err.message).unwrap_or(body);
    Err(Error::controller_unavailable(
        operation,
        format!("{}: {}", status, message),
    ))
}
