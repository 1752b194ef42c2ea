//! Caller authentication and request policies
//!
//! Policies named in a request are checked before any handler runs. A policy
//! name the worker does not know is a violation.

use std::collections::BTreeMap;
use std::sync::Arc;

use aws_lc_rs::constant_time::verify_slices_are_equal;
use aws_lc_rs::digest::{digest, SHA256};
use thiserror::Error;

use trellis_common::config::ApiToken;
use trellis_common::mesh::MeshRequest;

/// Policy requiring an authenticated caller
pub const AUTHENTICATED: &str = "authenticated";

/// Policy requiring the request's tenant to match the caller's
pub const TENANT_SCOPED: &str = "tenant_scoped";

/// Input field naming the tenant a request acts for
pub const TENANT_FIELD: &str = "tenant_id";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Caller id
    pub caller_id: String,
    /// Tenant the caller is scoped to
    pub tenant: Option<String>,
}

/// Resolves bearer tokens to callers
///
/// Only SHA-256 digests of the tokens are kept; comparison is constant time.
#[derive(Default)]
pub struct CallerAuthenticator {
    entries: Vec<(Vec<u8>, CallerIdentity)>,
}

impl std::fmt::Debug for CallerAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerAuthenticator")
            .field("callers", &self.entries.len())
            .finish()
    }
}

impl CallerAuthenticator {
    /// Authenticator accepting the configured tokens
    pub fn new(tokens: &[ApiToken]) -> Self {
        let entries = tokens
            .iter()
            .map(|t| {
                (
                    digest(&SHA256, t.token.as_bytes()).as_ref().to_vec(),
                    CallerIdentity {
                        caller_id: t.caller_id.clone(),
                        tenant: t.tenant.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Caller for a presented token
    pub fn authenticate(&self, token: &str) -> Option<CallerIdentity> {
        let presented = digest(&SHA256, token.as_bytes());
        let mut found = None;
        // Constant time over the whole list
        for (hash, caller) in &self.entries {
            if verify_slices_are_equal(hash, presented.as_ref()).is_ok() && found.is_none() {
                found = Some(caller.clone());
            }
        }
        found
    }
}

/// Why a policy rejected a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy '{policy}' denied the request: {reason}")]
pub struct PolicyViolation {
    /// Policy that failed
    pub policy: String,
    /// Explanation safe to return to the caller
    pub reason: String,
}

/// A named check run before dispatch
pub trait Policy: Send + Sync {
    /// Evaluate the request
    fn check(&self, caller: Option<&CallerIdentity>, request: &MeshRequest) -> Result<(), String>;
}

/// Caller must be authenticated
#[derive(Debug, Default)]
pub struct Authenticated;

impl Policy for Authenticated {
    fn check(&self, caller: Option<&CallerIdentity>, _request: &MeshRequest) -> Result<(), String> {
        caller
            .map(|_| ())
            .ok_or_else(|| "caller is not authenticated".to_string())
    }
}

/// Caller must be tenant-scoped and the request must name the same tenant
#[derive(Debug, Default)]
pub struct TenantScoped;

impl Policy for TenantScoped {
    fn check(&self, caller: Option<&CallerIdentity>, request: &MeshRequest) -> Result<(), String> {
        let tenant = caller
            .and_then(|c| c.tenant.as_deref())
            .ok_or_else(|| "caller is not scoped to a tenant".to_string())?;
        match request.input_data.get(TENANT_FIELD).and_then(|v| v.as_str()) {
            Some(requested) if requested == tenant => Ok(()),
            Some(_) => Err("request targets another tenant".to_string()),
            None => Err(format!("input does not name a {}", TENANT_FIELD)),
        }
    }
}

/// Named policies available to requests
pub struct PolicyEngine {
    policies: BTreeMap<String, Arc<dyn Policy>>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicyEngine {
    /// Engine without any policies; every named policy is a violation
    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    /// Engine with `authenticated` and `tenant_scoped`
    pub fn builtin() -> Self {
        Self::empty()
            .with(AUTHENTICATED, Arc::new(Authenticated))
            .with(TENANT_SCOPED, Arc::new(TenantScoped))
    }

    /// Add or replace a policy
    pub fn with(mut self, name: impl Into<String>, policy: Arc<dyn Policy>) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    /// Check every policy the request names; stops at the first violation
    pub fn evaluate(
        &self,
        caller: Option<&CallerIdentity>,
        request: &MeshRequest,
    ) -> Result<(), PolicyViolation> {
        for name in &request.policies {
            let policy = self.policies.get(name).ok_or_else(|| PolicyViolation {
                policy: name.clone(),
                reason: "unknown policy".to_string(),
            })?;
            policy.check(caller, request).map_err(|reason| PolicyViolation {
                policy: name.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}
