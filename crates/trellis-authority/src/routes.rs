//! HTTP surface of the authority and platform registry
//!
//! CSR submission authenticates with a bootstrap token. Every registry route
//! needs a verified worker certificate, and a worker may only act for ids of
//! its own service.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tracing::{debug, info, warn};

use trellis_common::protocol::{
    Ack, CsrRequest, CsrResponse, HeartbeatRequest, HeartbeatResponse, WorkerRegistration,
    CSR_PATH, WORKERS_PATH,
};

use crate::error::AuthorityError;
use crate::peer::PeerIdentity;
use crate::state::AuthorityState;

/// Extract bearer token from headers
fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthorityError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(AuthorityError::MissingAuth)?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| AuthorityError::Unauthorized)?;

    auth_str
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
        .ok_or(AuthorityError::Unauthorized)
}

/// CSR signing endpoint handler
pub async fn csr_handler(
    State(state): State<Arc<AuthorityState>>,
    headers: HeaderMap,
    Json(request): Json<CsrRequest>,
) -> Result<Json<CsrResponse>, AuthorityError> {
    debug!(service = %request.service_name, "CSR signing request received");
    let token = extract_bearer_token(&headers)?;
    let response = state.sign(&token, &request)?;
    info!(service = %request.service_name, "CSR signed");
    Ok(Json(response))
}

/// Peer may act for `worker_id`, and no other service registered it
fn authorize_worker(
    state: &AuthorityState,
    peer: &PeerIdentity,
    worker_id: &str,
) -> Result<(), AuthorityError> {
    peer.authorize(worker_id)
        .and_then(|()| state.check_owner(&peer.service, worker_id))
        .inspect_err(|e| {
            warn!(service = %peer.service, worker_id, error = %e, "Registry call refused");
        })
}

/// Worker registration handler
pub async fn register_handler(
    State(state): State<Arc<AuthorityState>>,
    peer: PeerIdentity,
    Json(registration): Json<WorkerRegistration>,
) -> Result<Json<Ack>, AuthorityError> {
    authorize_worker(&state, &peer, &registration.worker_id)?;
    state.register(&peer.service, registration).map(Json)
}

/// Heartbeat handler
pub async fn heartbeat_handler(
    State(state): State<Arc<AuthorityState>>,
    peer: PeerIdentity,
    Path(worker_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AuthorityError> {
    authorize_worker(&state, &peer, &worker_id)?;
    if request.worker_id != worker_id {
        return Err(AuthorityError::BadRequest(format!(
            "path worker id '{}' does not match body '{}'",
            worker_id, request.worker_id
        )));
    }
    state.heartbeat(&worker_id, &request).await.map(Json)
}

/// Deregistration handler; acknowledges unknown ids
pub async fn deregister_handler(
    State(state): State<Arc<AuthorityState>>,
    peer: PeerIdentity,
    Path(worker_id): Path<String>,
) -> Result<Json<Ack>, AuthorityError> {
    authorize_worker(&state, &peer, &worker_id)?;
    Ok(Json(state.deregister(&worker_id)))
}

/// Registry listing, for any verified worker
pub async fn list_workers_handler(
    State(state): State<Arc<AuthorityState>>,
    _peer: PeerIdentity,
) -> Json<Vec<WorkerRegistration>> {
    Json(state.workers())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Create the authority router
///
/// Routes:
/// - `POST /v1/certificates` - Sign a worker CSR (bearer bootstrap token)
/// - `POST /v1/workers` - Register a worker (client certificate)
/// - `GET /v1/workers` - List registrations (client certificate)
/// - `POST /v1/workers/{worker_id}/heartbeat` - Heartbeat (client certificate)
/// - `DELETE /v1/workers/{worker_id}` - Deregister (client certificate)
/// - `GET /healthz` - Liveness
pub fn authority_router(state: Arc<AuthorityState>) -> Router {
    Router::new()
        .route(CSR_PATH, post(csr_handler))
        .route(
            WORKERS_PATH,
            post(register_handler).get(list_workers_handler),
        )
        .route("/v1/workers/{worker_id}/heartbeat", post(heartbeat_handler))
        .route("/v1/workers/{worker_id}", delete(deregister_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}
