//! Authority endpoint errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use trellis_common::protocol::{codes, ErrorBody};
use trellis_pki::PkiError;

/// Errors returned by the authority/platform endpoints
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// Missing authorization header
    #[error("missing authorization header")]
    MissingAuth,

    /// Invalid or expired credential
    #[error("invalid or expired token")]
    Unauthorized,

    /// Registry call without a verified worker certificate
    #[error("a worker client certificate is required")]
    MissingClientCertificate,

    /// Certificate is valid but belongs to another service
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// CSR could not be parsed or verified
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Claimed identity does not match the credential or the CSR
    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    /// Another live worker holds the id
    #[error("worker id already registered: {0}")]
    DuplicateWorkerId(String),

    /// Service type not routed by this platform
    #[error("unsupported service type: {0}")]
    UnsupportedServiceType(String),

    /// No registration for the worker id
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// Malformed request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthorityError {
    /// Wire error code
    pub fn code(&self) -> &'static str {
        match self {
            AuthorityError::MissingAuth
            | AuthorityError::Unauthorized
            | AuthorityError::MissingClientCertificate => codes::UNAUTHORIZED,
            AuthorityError::Forbidden(_) => codes::FORBIDDEN,
            AuthorityError::InvalidCsr(_) => codes::INVALID_CSR,
            AuthorityError::IdentityConflict(_) => codes::IDENTITY_CONFLICT,
            AuthorityError::DuplicateWorkerId(_) => codes::DUPLICATE_WORKER_ID,
            AuthorityError::UnsupportedServiceType(_) => codes::UNSUPPORTED_SERVICE_TYPE,
            AuthorityError::UnknownWorker(_) => codes::UNKNOWN_WORKER,
            AuthorityError::BadRequest(_) => codes::BAD_REQUEST,
            AuthorityError::Internal(_) => codes::INTERNAL,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AuthorityError::MissingAuth
            | AuthorityError::Unauthorized
            | AuthorityError::MissingClientCertificate => StatusCode::UNAUTHORIZED,
            AuthorityError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthorityError::InvalidCsr(_) | AuthorityError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AuthorityError::IdentityConflict(_) | AuthorityError::DuplicateWorkerId(_) => {
                StatusCode::CONFLICT
            }
            AuthorityError::UnsupportedServiceType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AuthorityError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            AuthorityError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthorityError {
    fn into_response(self) -> Response {
        let message = match &self {
            AuthorityError::Internal(detail) => {
                error!(error = %detail, "Authority internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (self.status(), Json(ErrorBody::new(self.code(), message))).into_response()
    }
}

impl From<PkiError> for AuthorityError {
    fn from(e: PkiError) -> Self {
        match e {
            PkiError::InvalidCsr(msg) => AuthorityError::InvalidCsr(msg),
            PkiError::Parse(msg) => AuthorityError::InvalidCsr(msg),
            PkiError::IdentityConflict { .. } => AuthorityError::IdentityConflict(e.to_string()),
            other => AuthorityError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pki_errors_map_to_wire_codes() {
        let err: AuthorityError = PkiError::InvalidCsr("garbage".into()).into();
        assert_eq!(err.code(), codes::INVALID_CSR);

        let err: AuthorityError = PkiError::IdentityConflict {
            expected: "trellis-worker-a".into(),
            actual: "trellis-worker-b".into(),
        }
        .into();
        assert_eq!(err.code(), codes::IDENTITY_CONFLICT);

        let err: AuthorityError = PkiError::KeyGeneration("rng".into()).into();
        assert_eq!(err.code(), codes::INTERNAL);
    }

    #[tokio::test]
    async fn internal_details_are_not_sent() {
        let response = AuthorityError::Internal("disk /var/ca exploded".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.error, "internal");
        assert!(!body.message.contains("/var/ca"));
    }
}
