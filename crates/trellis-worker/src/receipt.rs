//! Request receipts

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use trellis_common::mesh::{MeshRequest, MeshResponse, Receipt};

/// Destination for receipts
#[cfg_attr(test, automock)]
pub trait ReceiptSink: Send + Sync {
    /// Record a receipt; must not block
    fn record(&self, receipt: &Receipt);
}

/// Emits receipts as structured log events
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReceiptSink;

impl ReceiptSink for LogReceiptSink {
    fn record(&self, receipt: &Receipt) {
        info!(
            receipt_id = %receipt.receipt_id,
            worker_id = %receipt.worker_id,
            job_id = %receipt.job_id,
            operation = %receipt.operation,
            outcome_hash = %receipt.outcome_hash,
            "Receipt"
        );
    }
}

/// Fresh receipt id
pub fn new_receipt_id() -> String {
    Uuid::new_v4().to_string()
}

/// SHA-256 over the outcome fields of a response, base64url
pub fn outcome_hash(response: &MeshResponse) -> String {
    let outcome = json!({
        "success": response.success,
        "result": response.result,
        "error": response.error,
        "message": response.message,
    });
    let bytes = serde_json::to_vec(&outcome).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(digest(&SHA256, &bytes).as_ref())
}

/// Receipt for a processed request
pub fn receipt_for(worker_id: &str, request: &MeshRequest, response: &MeshResponse) -> Receipt {
    Receipt {
        receipt_id: response.receipt_id.clone(),
        timestamp: Utc::now(),
        worker_id: worker_id.to_string(),
        job_id: request.job_id.clone(),
        operation: request.operation.clone(),
        outcome_hash: outcome_hash(response),
    }
}
