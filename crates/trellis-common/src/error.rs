//! Error types for Trellis workers
//!
//! Each variant names the operation or step that failed so a worker that
//! exits at startup prints a diagnostic an operator can act on.

use std::fmt;

use thiserror::Error;

/// Context reported by [`Error::internal`]
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Step of certificate acquisition that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStep {
    /// Local key pair generation
    KeyGeneration,
    /// Building the certificate signing request
    CsrGeneration,
    /// Submitting the CSR to the authority (network)
    Submission,
    /// The authority refused the CSR
    Rejected,
    /// The returned chain did not verify
    ChainValidation,
    /// The issued certificate carries a different public key than the CSR
    PublicKeyMismatch,
    /// The issued certificate names a different identity
    IdentityMismatch,
    /// The issued certificate is outside its validity window
    ValidityWindow,
    /// Installing the bundle into the certificate store
    Storage,
}

impl AcquisitionStep {
    /// Stable lowercase name used in logs and diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyGeneration => "key_generation",
            Self::CsrGeneration => "csr_generation",
            Self::Submission => "submission",
            Self::Rejected => "rejected",
            Self::ChainValidation => "chain_validation",
            Self::PublicKeyMismatch => "public_key_mismatch",
            Self::IdentityMismatch => "identity_mismatch",
            Self::ValidityWindow => "validity_window",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for AcquisitionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Certificate acquisition failed at a specific step
    #[error("certificate acquisition failed at step {step}: {message}")]
    CertificateAcquisition {
        /// Which step failed
        step: AcquisitionStep,
        /// Underlying failure
        message: String,
    },

    /// The controller/authority could not be reached
    #[error("controller unavailable during {operation}: {message}")]
    ControllerUnavailable {
        /// Operation being attempted (register, heartbeat, deregister, csr)
        operation: String,
        /// Transport failure or status
        message: String,
    },

    /// The platform refused a registration or heartbeat
    #[error("registration rejected during {operation} [{code}]: {message}")]
    Registration {
        /// Operation being attempted
        operation: String,
        /// Wire error code returned by the platform
        code: String,
        /// Description returned by the platform
        message: String,
    },

    /// Invalid or missing configuration
    #[error("configuration error for {key}: {message}")]
    Config {
        /// Environment variable or setting name
        key: String,
        /// Why the value was refused
        message: String,
    },

    /// Listener or client TLS could not be configured
    #[error("tls error: {message}")]
    Tls {
        /// rustls or PEM failure
        message: String,
    },

    /// A wire payload could not be encoded or decoded
    #[error("malformed payload: {message}")]
    Serialization {
        /// serde_json failure
        message: String,
    },

    /// Filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying error
        #[from]
        source: std::io::Error,
    },

    /// Anything else that went wrong inside the worker
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// What happened
        message: String,
        /// Context where the error occurred (e.g., "lifecycle", "renewal", "server")
        context: String,
    },
}

impl Error {
    /// Create a certificate acquisition error for the given step
    pub fn acquisition(step: AcquisitionStep, msg: impl Into<String>) -> Self {
        Self::CertificateAcquisition {
            step,
            message: msg.into(),
        }
    }

    /// Create a controller-unavailable error for an operation
    pub fn controller_unavailable(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ControllerUnavailable {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a registration rejection carrying the platform's error code
    pub fn registration(
        operation: impl Into<String>,
        code: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Registration {
            operation: operation.into(),
            code: code.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a key
    pub fn config(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls {
            message: msg.into(),
        }
    }

    /// Payload encode or decode failure
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Internal error without a known context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Internal error tagged with the subsystem it came from
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether repeating the operation could succeed
    ///
    /// Only network-level failures are retried. Rejections, validation
    /// failures and configuration errors require an operator to fix something.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::CertificateAcquisition { step, .. } => *step == AcquisitionStep::Submission,
            Error::ControllerUnavailable { .. } => true,
            Error::Io { .. } | Error::Internal { .. } => true,
            Error::Registration { .. }
            | Error::Config { .. }
            | Error::Tls { .. }
            | Error::Serialization { .. } => false,
        }
    }

    /// Get the failed acquisition step, if this is an acquisition error
    pub fn acquisition_step(&self) -> Option<AcquisitionStep> {
        match self {
            Error::CertificateAcquisition { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Operation, config key or subsystem the error is about
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::ControllerUnavailable { operation, .. } => Some(operation),
            Error::Registration { operation, .. } => Some(operation),
            Error::Config { key, .. } => Some(key),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Result type alias using our Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
