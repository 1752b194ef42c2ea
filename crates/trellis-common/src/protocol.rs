//! Wire types for worker <-> authority/platform communication
//!
//! These types are shared between the worker (client) and the reference
//! authority (server). All bodies are JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mesh::CapabilityDescriptor;

/// Path for CSR submission (bootstrap channel, bearer token)
pub const CSR_PATH: &str = "/v1/certificates";

/// Path for worker registration
pub const WORKERS_PATH: &str = "/v1/workers";

/// Path of a single worker registration
pub fn worker_path(worker_id: &str) -> String {
    format!("{}/{}", WORKERS_PATH, worker_id)
}

/// Path of a worker's heartbeat endpoint
pub fn heartbeat_path(worker_id: &str) -> String {
    format!("{}/{}/heartbeat", WORKERS_PATH, worker_id)
}

/// Error codes returned in [`ErrorBody::error`]
pub mod codes {
    /// CSR could not be parsed or its signature is invalid
    pub const INVALID_CSR: &str = "invalid_csr";
    /// CSR identity differs from the identity the credential was issued for
    pub const IDENTITY_CONFLICT: &str = "identity_conflict";
    /// Missing or invalid credential
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// Credential is valid but names a different worker
    pub const FORBIDDEN: &str = "forbidden";
    /// Another live worker holds this worker id
    pub const DUPLICATE_WORKER_ID: &str = "duplicate_worker_id";
    /// The platform does not route to this service type
    pub const UNSUPPORTED_SERVICE_TYPE: &str = "unsupported_service_type";
    /// No registration exists for the worker id
    pub const UNKNOWN_WORKER: &str = "unknown_worker";
    /// Malformed request body
    pub const BAD_REQUEST: &str = "bad_request";
    /// Server-side failure; details are only logged
    pub const INTERNAL: &str = "internal";
}

/// CSR submission from worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrRequest {
    /// Claimed service identity
    pub service_name: String,
    /// CSR in PEM format
    pub csr_pem: String,
    /// Additional subject alternative names requested
    #[serde(default)]
    pub requested_sans: Vec<String>,
}

/// Signed certificate returned by the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrResponse {
    /// Signed certificate in PEM format
    pub certificate_pem: String,
    /// CA certificates, issuer first, each in PEM format
    pub ca_chain_pem: Vec<String>,
}

/// Health of a worker as seen by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered, not yet heartbeating
    Starting,
    /// Heartbeating and serving
    Healthy,
    /// Serving, but heartbeats are failing or an internal issue is reported
    Degraded,
    /// Inferred by the platform when heartbeats stop arriving
    Unreachable,
    /// Removed from routing
    Deregistered,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Deregistered => "deregistered",
        };
        f.write_str(s)
    }
}

/// A worker's registration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Stable id: service name plus instance
    pub worker_id: String,
    /// Registry key of the worker's capability set
    pub service_type: String,
    /// Operations the worker accepts
    pub capabilities: Vec<CapabilityDescriptor>,
    /// mTLS endpoint the platform routes to
    pub endpoint: String,
    /// Current status
    pub status: WorkerStatus,
    /// Fraction of capacity in use, 0.0 to 1.0
    pub load_score: f64,
    /// Time of the last accepted heartbeat
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Acknowledgement of a registration or deregistration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Worker the acknowledgement refers to
    pub worker_id: String,
}

/// Periodic liveness report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Reporting worker
    pub worker_id: String,
    /// Status as the worker sees itself
    pub status: WorkerStatus,
    /// Fraction of capacity in use, 0.0 to 1.0
    pub load_score: f64,
    /// Worker clock at send time
    pub timestamp: DateTime<Utc>,
}

/// What the platform wants the worker to do after a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatAction {
    /// Keep going
    Ack,
    /// Shut down and deregister
    Deregister,
}

/// Heartbeat reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Instruction for the worker
    pub action: HeartbeatAction,
}

/// Error body returned by the authority and the worker's own HTTP surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (see [`codes`])
    pub error: String,
    /// Human-readable description
    pub message: String,
}

impl ErrorBody {
    /// Build an error body
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
