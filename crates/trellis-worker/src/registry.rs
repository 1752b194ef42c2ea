//! Capability sets and the service-type registry
//!
//! A [`CapabilitySet`] is the dispatch table of one service type: operation
//! name to descriptor and handler. The [`ServiceRegistry`] maps service types
//! to capability sets and is built once at startup.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use trellis_common::mesh::CapabilityDescriptor;

/// Failure reported by a handler
///
/// The message is returned to the caller, so handlers must not put internal
/// detail in it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Handler error with a caller-safe message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Business logic behind one operation
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Process the operation input
    async fn handle(&self, input: Value) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`CapabilityHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, input: Value) -> Result<Value, HandlerError> {
        (self.0)(input).await
    }
}

/// One declared operation
#[derive(Clone)]
pub struct Capability {
    /// What the worker advertises
    pub descriptor: CapabilityDescriptor,
    /// What runs when the operation is invoked
    pub handler: Arc<dyn CapabilityHandler>,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("operation", &self.descriptor.operation)
            .finish()
    }
}

/// Dispatch table for one service type
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    service_type: String,
    capabilities: BTreeMap<String, Capability>,
}

impl CapabilitySet {
    /// Empty set for a service type
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            capabilities: BTreeMap::new(),
        }
    }

    /// Add an operation; a later descriptor for the same operation replaces
    /// the earlier one
    pub fn with(
        mut self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        self.capabilities.insert(
            descriptor.operation.clone(),
            Capability {
                descriptor,
                handler,
            },
        );
        self
    }

    /// Service type served by this set
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Look up an operation
    pub fn get(&self, operation: &str) -> Option<&Capability> {
        self.capabilities.get(operation)
    }

    /// Advertised descriptors, sorted by operation
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.capabilities
            .values()
            .map(|c| c.descriptor.clone())
            .collect()
    }

    /// Operation names
    pub fn operations(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }
}

/// Service type to capability set
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, CapabilitySet>,
}

impl ServiceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled `echo` and `classifier` services
    pub fn builtin() -> Self {
        Self::new().with(echo_service()).with(classifier_service())
    }

    /// Add a capability set, keyed by its service type
    pub fn with(mut self, set: CapabilitySet) -> Self {
        self.services.insert(set.service_type.clone(), set);
        self
    }

    /// Capability set for a service type
    pub fn get(&self, service_type: &str) -> Option<&CapabilitySet> {
        self.services.get(service_type)
    }

    /// Known service types
    pub fn service_types(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }
}

/// Echo service: returns its input; used for smoke tests of the mesh path
pub fn echo_service() -> CapabilitySet {
    CapabilitySet::new("echo").with(
        CapabilityDescriptor::new("echo", "Return the input unchanged"),
        Arc::new(FnHandler(|input: Value| async move { Ok::<_, HandlerError>(input) })),
    )
}

const CLASSIFIER_LABELS: &[(&str, &[&str])] = &[
    ("invoice", &["invoice", "amount due", "payment terms"]),
    ("receipt", &["receipt", "paid", "thank you for your purchase"]),
    ("contract", &["agreement", "hereinafter", "party"]),
];

/// Keyword classifier standing in for a document classification backend
pub fn classifier_service() -> CapabilitySet {
    CapabilitySet::new("classifier").with(
        CapabilityDescriptor::new("classify", "Assign a document type label to text")
            .with_input_schema(json!({
                "type": "object",
                "required": ["text"],
                "properties": {"text": {"type": "string"}}
            }))
            .with_output_schema(json!({
                "type": "object",
                "properties": {
                    "label": {"type": "string"},
                    "matches": {"type": "integer"}
                }
            })),
        Arc::new(FnHandler(|input: Value| async move {
            let text = input
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::new("text must be a string"))?
                .to_lowercase();
            let (label, matches) = CLASSIFIER_LABELS
                .iter()
                .map(|(label, keywords)| {
                    (*label, keywords.iter().filter(|k| text.contains(*k)).count())
                })
                .max_by_key(|(_, matches)| *matches)
                .filter(|(_, matches)| *matches > 0)
                .unwrap_or(("unknown", 0));
            Ok::<_, HandlerError>(json!({"label": label, "matches": matches}))
        })),
    )
}
