//! Mesh dispatch boundary
//!
//! Every request ends in a [`MeshResponse`] with a fresh receipt id. Handler
//! errors and panics are turned into `HandlerFailure` here and never reach
//! the server task.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use trellis_common::mesh::{CapabilityDescriptor, MeshErrorKind, MeshRequest, MeshResponse};

use crate::policy::{CallerIdentity, PolicyEngine};
use crate::receipt::{new_receipt_id, receipt_for, ReceiptSink};
use crate::registry::CapabilitySet;

/// Message returned when a handler panics
pub const HANDLER_PANIC_MESSAGE: &str = "handler failed unexpectedly";

/// Routes mesh requests to capability handlers
pub struct Dispatcher {
    worker_id: String,
    capabilities: CapabilitySet,
    policies: PolicyEngine,
    sink: Arc<dyn ReceiptSink>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_id", &self.worker_id)
            .field("service_type", &self.capabilities.service_type())
            .field("operations", &self.capabilities.operations())
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher for one worker's capability set
    pub fn new(
        worker_id: impl Into<String>,
        capabilities: CapabilitySet,
        policies: PolicyEngine,
        sink: Arc<dyn ReceiptSink>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities,
            policies,
            sink,
        }
    }

    /// Declared capabilities
    pub fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        self.capabilities.descriptors()
    }

    /// Operation names sent at registration
    pub fn operations(&self) -> Vec<String> {
        self.capabilities
            .operations()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Process one request and record its receipt
    pub async fn process(
        &self,
        caller: Option<&CallerIdentity>,
        request: MeshRequest,
    ) -> MeshResponse {
        let receipt_id = new_receipt_id();
        let response = match self.run(caller, &request).await {
            Ok(result) => MeshResponse::success(result, receipt_id),
            Err((kind, message)) => {
                debug!(
                    job_id = %request.job_id,
                    operation = %request.operation,
                    error = %kind,
                    "Request rejected"
                );
                MeshResponse::failure(kind, message, receipt_id)
            }
        };
        self.sink
            .record(&receipt_for(&self.worker_id, &request, &response));
        response
    }

    async fn run(
        &self,
        caller: Option<&CallerIdentity>,
        request: &MeshRequest,
    ) -> Result<Value, (MeshErrorKind, String)> {
        let capability = (request.service_type == self.capabilities.service_type())
            .then(|| self.capabilities.get(&request.operation))
            .flatten()
            .ok_or_else(|| {
                (
                    MeshErrorKind::UnsupportedOperation,
                    format!(
                        "operation '{}' is not supported by service type '{}'",
                        request.operation,
                        self.capabilities.service_type()
                    ),
                )
            })?;

        self.policies.evaluate(caller, request).map_err(|violation| {
            warn!(
                job_id = %request.job_id,
                policy = %violation.policy,
                "Policy violation"
            );
            (MeshErrorKind::PolicyViolation, violation.to_string())
        })?;

        let missing = missing_fields(&capability.descriptor, &request.input_data);
        if !missing.is_empty() {
            return Err((
                MeshErrorKind::InvalidInput,
                format!("missing required fields: {}", missing.join(", ")),
            ));
        }

        let handler = capability.handler.clone();
        match AssertUnwindSafe(handler.handle(request.input_data.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(
                    job_id = %request.job_id,
                    operation = %request.operation,
                    error = %e,
                    "Handler returned an error"
                );
                Err((MeshErrorKind::HandlerFailure, e.to_string()))
            }
            Err(_) => {
                // Payload stays local
                error!(
                    job_id = %request.job_id,
                    operation = %request.operation,
                    "Handler panicked"
                );
                Err((
                    MeshErrorKind::HandlerFailure,
                    HANDLER_PANIC_MESSAGE.to_string(),
                ))
            }
        }
    }
}

/// Required fields absent from an object input
///
/// Non-object inputs are left to the handler.
fn missing_fields<'a>(descriptor: &'a CapabilityDescriptor, input: &Value) -> Vec<&'a str> {
    let Some(object) = input.as_object() else {
        return Vec::new();
    };
    descriptor
        .required_fields()
        .into_iter()
        .filter(|field| !object.contains_key(*field))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AUTHENTICATED;
    use crate::receipt::MockReceiptSink;
    use crate::registry::{classifier_service, CapabilityHandler, FnHandler, HandlerError};
    use async_trait::async_trait;
    use serde_json::json;

    struct Panics(&'static str);

    #[async_trait]
    impl CapabilityHandler for Panics {
        async fn handle(&self, _input: Value) -> Result<Value, HandlerError> {
            panic!("{}", self.0)
        }
    }

    fn request(operation: &str, input: Value) -> MeshRequest {
        MeshRequest {
            job_id: "job-7".into(),
            service_type: "classifier".into(),
            operation: operation.into(),
            input_data: input,
            policies: BTreeSet::new(),
        }
    }

    fn recording_sink(times: usize) -> Arc<MockReceiptSink> {
        let mut sink = MockReceiptSink::new();
        sink.expect_record()
            .withf(|r| r.worker_id == "classifier-0" && r.job_id == "job-7")
            .times(times)
            .return_const(());
        Arc::new(sink)
    }

    fn dispatcher(set: CapabilitySet, sink: Arc<MockReceiptSink>) -> Dispatcher {
        Dispatcher::new("classifier-0", set, PolicyEngine::builtin(), sink)
    }

    #[tokio::test]
    async fn story_unsupported_operation_gets_structured_failure() {
        let d = dispatcher(classifier_service(), recording_sink(1));
        let resp = d.process(None, request("convert", json!({}))).await;

        assert!(!resp.success);
        assert_eq!(resp.error, Some(MeshErrorKind::UnsupportedOperation));
        assert!(resp.result.is_none());
        assert!(!resp.receipt_id.is_empty());
        assert_eq!(d.operations(), vec!["classify"]);
    }

    #[tokio::test]
    async fn wrong_service_type_is_unsupported() {
        let d = dispatcher(classifier_service(), recording_sink(1));
        let mut req = request("classify", json!({"text": "x"}));
        req.service_type = "ocr".into();
        let resp = d.process(None, req).await;
        assert_eq!(resp.error, Some(MeshErrorKind::UnsupportedOperation));
    }

    #[tokio::test]
    async fn successful_request_returns_result() {
        let d = dispatcher(classifier_service(), recording_sink(1));
        let resp = d
            .process(None, request("classify", json!({"text": "Invoice"})))
            .await;
        assert!(resp.success);
        assert_eq!(resp.result.unwrap()["label"], "invoice");
    }

    #[tokio::test]
    async fn receipt_ids_are_fresh_per_request() {
        let d = dispatcher(classifier_service(), recording_sink(2));
        let a = d.process(None, request("classify", json!({"text": "a"}))).await;
        let b = d.process(None, request("classify", json!({"text": "a"}))).await;
        assert_ne!(a.receipt_id, b.receipt_id);
    }

    #[tokio::test]
    async fn policy_checked_before_handler() {
        let set = CapabilitySet::new("classifier").with(
            CapabilityDescriptor::new("classify", "never runs"),
            Arc::new(Panics("handler must not run")),
        );
        let d = dispatcher(set, recording_sink(1));
        let mut req = request("classify", json!({}));
        req.policies.insert(AUTHENTICATED.into());

        let resp = d.process(None, req).await;
        assert_eq!(resp.error, Some(MeshErrorKind::PolicyViolation));
        assert!(resp.message.unwrap().contains(AUTHENTICATED));
    }

    #[tokio::test]
    async fn missing_required_fields_are_invalid_input() {
        let d = dispatcher(classifier_service(), recording_sink(1));
        let resp = d.process(None, request("classify", json!({}))).await;
        assert_eq!(resp.error, Some(MeshErrorKind::InvalidInput));
        assert_eq!(resp.message.as_deref(), Some("missing required fields: text"));
    }

    #[tokio::test]
    async fn handler_error_becomes_failure() {
        let set = CapabilitySet::new("classifier").with(
            CapabilityDescriptor::new("classify", "fails"),
            Arc::new(FnHandler(|_: Value| async move {
                Err::<Value, _>(HandlerError::new("backend rejected document"))
            })),
        );
        let d = dispatcher(set, recording_sink(1));
        let resp = d.process(None, request("classify", json!({}))).await;
        assert_eq!(resp.error, Some(MeshErrorKind::HandlerFailure));
        assert_eq!(resp.message.as_deref(), Some("backend rejected document"));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let set = CapabilitySet::new("classifier").with(
            CapabilityDescriptor::new("classify", "panics"),
            Arc::new(Panics("secret internal state")),
        );
        let d = dispatcher(set, recording_sink(1));
        let resp = d.process(None, request("classify", json!({}))).await;

        assert!(!resp.success);
        assert_eq!(resp.error, Some(MeshErrorKind::HandlerFailure));
        assert_eq!(resp.message.as_deref(), Some(HANDLER_PANIC_MESSAGE));
        assert!(!serde_json::to_string(&resp).unwrap().contains("secret"));
    }
}
