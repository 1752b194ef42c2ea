//! Worker HTTP surface
//!
//! Two listeners: the mesh listener requires a client certificate from the
//! mesh CA and a bearer token for `/v1/process`; the plaintext health
//! listener answers liveness and readiness probes without authentication.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use trellis_common::mesh::{CapabilityDescriptor, MeshRequest, MeshResponse};
use trellis_common::protocol::{codes, ErrorBody};
use trellis_common::{Error, Result};
use trellis_pki::{server_config, CertificateStore, ClientAuth};

use crate::dispatch::Dispatcher;
use crate::health::InternalHealth;
use crate::lifecycle::Lifecycle;
use crate::load::LoadTracker;
use crate::policy::CallerAuthenticator;

/// Mesh request endpoint
pub const PROCESS_PATH: &str = "/v1/process";

/// Capability discovery endpoint
pub const CAPABILITIES_PATH: &str = "/v1/capabilities";

/// Liveness probe
pub const LIVE_PATH: &str = "/health/live";

/// Readiness probe
pub const READY_PATH: &str = "/health/ready";

/// Rejections produced before a request reaches the dispatcher
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No bearer token was presented
    #[error("missing bearer token")]
    MissingAuth,

    /// The bearer token is not accepted
    #[error("invalid bearer token")]
    Unauthorized,

    /// The body is not a mesh request
    #[error("malformed request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::MissingAuth | ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, codes::UNAUTHORIZED)
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, codes::BAD_REQUEST),
        };
        (status, Json(ErrorBody::new(code, self.to_string()))).into_response()
    }
}

/// State shared by mesh handlers
#[derive(Clone)]
pub struct MeshState {
    /// Request dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Bearer token verification
    pub authenticator: Arc<CallerAuthenticator>,
    /// In-flight request accounting
    pub load: Arc<LoadTracker>,
    /// Lifecycle, for the health routes on the mesh listener
    pub lifecycle: Arc<Lifecycle>,
    /// Self-reported issues
    pub health: Arc<InternalHealth>,
}

/// State shared by health handlers
#[derive(Clone)]
pub struct HealthState {
    /// Lifecycle whose phase is reported
    pub lifecycle: Arc<Lifecycle>,
    /// Self-reported issues
    pub health: Arc<InternalHealth>,
}

fn bearer_token(headers: &HeaderMap) -> std::result::Result<&str, ApiError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(ApiError::MissingAuth)?
        .to_str()
        .map_err(|_| ApiError::Unauthorized)?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)
}

/// Mesh request handler
pub async fn process_handler(
    State(state): State<MeshState>,
    headers: HeaderMap,
    body: std::result::Result<Json<MeshRequest>, JsonRejection>,
) -> std::result::Result<Json<MeshResponse>, ApiError> {
    let caller = state
        .authenticator
        .authenticate(bearer_token(&headers)?)
        .ok_or(ApiError::Unauthorized)?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let _guard = state.load.begin();
    debug!(
        caller = %caller.caller_id,
        job_id = %request.job_id,
        operation = %request.operation,
        "Mesh request"
    );
    Ok(Json(state.dispatcher.process(Some(&caller), request).await))
}

/// Capability discovery handler
pub async fn capabilities_handler(
    State(state): State<MeshState>,
) -> Json<Vec<CapabilityDescriptor>> {
    Json(state.dispatcher.capabilities())
}

/// Liveness: answers while the process runs, whatever the phase
pub async fn live_handler(State(state): State<HealthState>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "worker_id": state.lifecycle.worker_id(),
        "phase": state.lifecycle.phase(),
    }))
}

/// Readiness: 200 while Healthy or Degraded, 503 otherwise
pub async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let phase = state.lifecycle.phase();
    let status = if phase.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ready": phase.is_serving(),
            "phase": phase,
            "issues": state.health.issues(),
        })),
    )
}

/// Routes served on the plaintext health listener
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route(LIVE_PATH, get(live_handler))
        .route(READY_PATH, get(ready_handler))
        .with_state(state)
}

/// Routes served on the mTLS listener
pub fn mesh_router(state: MeshState) -> Router {
    let health = health_router(HealthState {
        lifecycle: state.lifecycle.clone(),
        health: state.health.clone(),
    });
    Router::new()
        .route(PROCESS_PATH, post(process_handler))
        .route(CAPABILITIES_PATH, get(capabilities_handler))
        .with_state(state)
        .merge(health)
}

/// A bound listener
pub struct Listener {
    local_addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Listener {
    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let in-flight requests finish within `grace`, then
    /// wait for the server task
    pub async fn shutdown(self, grace: std::time::Duration) {
        self.handle.graceful_shutdown(Some(grace));
        if let Err(e) = self.task.await {
            error!(addr = %self.local_addr, error = %e, "Server task failed");
        }
    }

    /// Close immediately
    pub async fn abort(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}

/// Serve `router` over mTLS with the certificate from `store`
///
/// Clients must present a certificate chaining to `trust_chain`. The
/// certificate is resolved per handshake, so a renewal applies to the next
/// connection.
pub async fn serve_mesh(
    addr: SocketAddr,
    store: Arc<CertificateStore>,
    trust_chain: Vec<String>,
    router: Router,
) -> Result<Listener> {
    let tls = server_config(store, ClientAuth::Required(trust_chain))
        .map_err(|e| Error::tls(e.to_string()))?;
    let tls_config = RustlsConfig::from_config(Arc::new(tls));

    let handle = Handle::new();
    let server_handle = handle.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .handle(server_handle)
            .serve(router.into_make_service())
            .await
        {
            error!(addr = %addr, error = %e, "Mesh server error");
        }
    });

    let local_addr = listening(&handle, addr, "mesh listener").await?;
    info!(addr = %local_addr, "Mesh listener bound");
    Ok(Listener {
        local_addr,
        handle,
        task,
    })
}

/// Serve `router` over plain HTTP
pub async fn serve_health(addr: SocketAddr, router: Router) -> Result<Listener> {
    let handle = Handle::new();
    let server_handle = handle.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum_server::bind(addr)
            .handle(server_handle)
            .serve(router.into_make_service())
            .await
        {
            error!(addr = %addr, error = %e, "Health server error");
        }
    });

    let local_addr = listening(&handle, addr, "health listener").await?;
    info!(addr = %local_addr, "Health listener bound");
    Ok(Listener {
        local_addr,
        handle,
        task,
    })
}

async fn listening(handle: &Handle, addr: SocketAddr, what: &str) -> Result<SocketAddr> {
    handle
        .listening()
        .await
        .ok_or_else(|| Error::internal_with_context(what, format!("failed to bind {}", addr)))
}
