//! Mesh request/response envelope
//!
//! The platform (or any authorized client) sends a [`MeshRequest`] to a
//! worker's process endpoint and always gets a [`MeshResponse`] back, carrying
//! a fresh receipt id whether the call succeeded or not.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared operation a worker accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Operation name, unique within a capability set
    pub operation: String,
    /// Human-readable description
    pub description: String,
    /// JSON schema of the input
    #[serde(default)]
    pub input_schema: Value,
    /// JSON schema of the output
    #[serde(default)]
    pub output_schema: Value,
}

impl CapabilityDescriptor {
    /// Descriptor accepting and returning arbitrary JSON
    pub fn new(operation: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({"type": "object"}),
        }
    }

    /// Replace the input schema
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Replace the output schema
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Top-level fields the input schema lists as `required`
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Request routed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshRequest {
    /// Caller-assigned job id
    pub job_id: String,
    /// Service type the request is meant for
    pub service_type: String,
    /// Operation to invoke
    pub operation: String,
    /// Operation input
    #[serde(default)]
    pub input_data: Value,
    /// Policies that must pass before the handler runs
    #[serde(default)]
    pub policies: BTreeSet<String>,
}

/// Category of a failed mesh request
///
/// Serialized with the exact variant name, e.g. `"UnsupportedOperation"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshErrorKind {
    /// Operation not in the worker's declared capabilities
    UnsupportedOperation,
    /// A required policy did not pass
    PolicyViolation,
    /// Input is missing fields required by the capability's schema
    InvalidInput,
    /// The handler returned an error or panicked
    HandlerFailure,
}

impl fmt::Display for MeshErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnsupportedOperation => "UnsupportedOperation",
            Self::PolicyViolation => "PolicyViolation",
            Self::InvalidInput => "InvalidInput",
            Self::HandlerFailure => "HandlerFailure",
        };
        f.write_str(s)
    }
}

/// Reply to a mesh request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshResponse {
    /// Whether the handler produced a result
    pub success: bool,
    /// Handler output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure category on error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MeshErrorKind>,
    /// Failure description safe to show the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Id of the receipt recorded for this request
    pub receipt_id: String,
}

impl MeshResponse {
    /// Successful response
    pub fn success(result: Value, receipt_id: impl Into<String>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            message: None,
            receipt_id: receipt_id.into(),
        }
    }

    /// Failed response
    pub fn failure(
        error: MeshErrorKind,
        message: impl Into<String>,
        receipt_id: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            message: Some(message.into()),
            receipt_id: receipt_id.into(),
        }
    }
}

/// Immutable audit record of a processed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Unique receipt id, also returned in the response
    pub receipt_id: String,
    /// When processing finished
    pub timestamp: DateTime<Utc>,
    /// Worker that processed the request
    pub worker_id: String,
    /// Job the receipt belongs to
    pub job_id: String,
    /// Operation invoked
    pub operation: String,
    /// SHA-256 of the response outcome, base64url
    pub outcome_hash: String,
}
