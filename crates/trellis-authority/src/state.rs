//! In-memory authority and platform state
//!
//! One [`AuthorityState`] holds the CA, the issued bootstrap tokens (hashed)
//! and the worker registry. It also carries fault-injection switches used by
//! integration tests to simulate a misbehaving platform.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trellis_common::protocol::{
    Ack, CsrRequest, CsrResponse, HeartbeatAction, HeartbeatRequest, HeartbeatResponse,
    WorkerRegistration, WorkerStatus,
};
use trellis_pki::pki::DEFAULT_WORKER_CERT_TTL;
use trellis_pki::CertificateAuthority;

use crate::error::AuthorityError;
use crate::token::BootstrapToken;

/// Default lifetime of a bootstrap token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Authority behaviour settings
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Lifetime of issued worker certificates
    pub cert_ttl: Duration,
    /// Lifetime of bootstrap tokens
    pub token_ttl: Duration,
    /// Service types the platform routes to; None accepts any
    pub supported_service_types: Option<BTreeSet<String>>,
    /// Heartbeat silence after which a worker is marked Unreachable
    pub unreachable_after: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            cert_ttl: DEFAULT_WORKER_CERT_TTL,
            token_ttl: DEFAULT_TOKEN_TTL,
            supported_service_types: None,
            unreachable_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenGrant {
    service_name: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct WorkerRecord {
    registration: WorkerRegistration,
    /// Service of the certificate that registered it
    owner: String,
    last_seen: Instant,
}

/// Shared authority state
pub struct AuthorityState {
    ca: CertificateAuthority,
    config: AuthorityConfig,
    tokens: DashMap<String, TokenGrant>,
    workers: DashMap<String, WorkerRecord>,
    pending_deregister: DashSet<String>,
    heartbeat_delay_ms: AtomicU64,
    certificates_issued: AtomicU64,
    heartbeats_received: AtomicU64,
}

impl std::fmt::Debug for AuthorityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityState")
            .field("config", &self.config)
            .field("tokens", &self.tokens.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl AuthorityState {
    /// Create state around a CA
    pub fn new(ca: CertificateAuthority, config: AuthorityConfig) -> Self {
        Self {
            ca,
            config,
            tokens: DashMap::new(),
            workers: DashMap::new(),
            pending_deregister: DashSet::new(),
            heartbeat_delay_ms: AtomicU64::new(0),
            certificates_issued: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
        }
    }

    /// The CA
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// CA certificate PEM, the trust anchor handed to workers
    pub fn ca_cert_pem(&self) -> &str {
        self.ca.ca_cert_pem()
    }

    /// Issue a bootstrap token bound to a service identity
    pub fn issue_token(&self, service_name: &str) -> Result<BootstrapToken, AuthorityError> {
        let token =
            BootstrapToken::generate().map_err(|e| AuthorityError::Internal(e.to_string()))?;
        self.tokens.insert(
            token.hash().to_string(),
            TokenGrant {
                service_name: service_name.to_string(),
                expires_at: Instant::now() + self.config.token_ttl,
            },
        );
        info!(service = %service_name, token_hash = %token.hash(), "Issued bootstrap token");
        Ok(token)
    }

    /// Service a token was issued for, if it is known and unexpired
    fn authorize(&self, token: &str) -> Result<String, AuthorityError> {
        let token: BootstrapToken = token.parse().map_err(|_| AuthorityError::Unauthorized)?;
        let hash = token.hash();
        let grant = self
            .tokens
            .get(hash)
            .map(|g| g.clone())
            .ok_or(AuthorityError::Unauthorized)?;
        if Instant::now() >= grant.expires_at {
            self.tokens.remove(hash);
            return Err(AuthorityError::Unauthorized);
        }
        Ok(grant.service_name)
    }

    /// Sign a worker CSR
    ///
    /// Tokens stay valid until they expire so the same worker can renew.
    pub fn sign(&self, token: &str, request: &CsrRequest) -> Result<CsrResponse, AuthorityError> {
        let granted_service = self.authorize(token)?;
        if granted_service != request.service_name {
            warn!(
                granted = %granted_service,
                claimed = %request.service_name,
                "CSR identity does not match token"
            );
            return Err(AuthorityError::IdentityConflict(format!(
                "token was issued for '{}', request claims '{}'",
                granted_service, request.service_name
            )));
        }

        let certificate_pem = self.ca.sign_csr(
            &request.csr_pem,
            &request.service_name,
            &request.requested_sans,
            self.config.cert_ttl,
        )?;
        self.certificates_issued.fetch_add(1, Ordering::SeqCst);

        Ok(CsrResponse {
            certificate_pem,
            ca_chain_pem: vec![self.ca.ca_cert_pem().to_string()],
        })
    }

    /// Fails when `worker_id` was registered by a different service
    pub fn check_owner(&self, owner: &str, worker_id: &str) -> Result<(), AuthorityError> {
        match self.workers.get(worker_id) {
            Some(record) if record.owner != owner => Err(AuthorityError::Forbidden(format!(
                "worker '{}' belongs to service '{}'",
                worker_id, record.owner
            ))),
            _ => Ok(()),
        }
    }

    /// Record a registration made by a peer of service `owner`
    ///
    /// A worker id can be re-registered from the same endpoint (restart) or
    /// after its previous holder went away; a live worker at another endpoint
    /// keeps the id. Ids never move between services.
    pub fn register(
        &self,
        owner: &str,
        registration: WorkerRegistration,
    ) -> Result<Ack, AuthorityError> {
        self.check_owner(owner, &registration.worker_id)?;

        if let Some(supported) = &self.config.supported_service_types {
            if !supported.contains(&registration.service_type) {
                return Err(AuthorityError::UnsupportedServiceType(
                    registration.service_type,
                ));
            }
        }

        if let Some(existing) = self.workers.get(&registration.worker_id) {
            let live = !matches!(
                existing.registration.status,
                WorkerStatus::Deregistered | WorkerStatus::Unreachable
            );
            if live && existing.registration.endpoint != registration.endpoint {
                return Err(AuthorityError::DuplicateWorkerId(registration.worker_id));
            }
        }

        let worker_id = registration.worker_id.clone();
        self.pending_deregister.remove(&worker_id);
        info!(
            worker_id = %worker_id,
            service_type = %registration.service_type,
            endpoint = %registration.endpoint,
            capabilities = registration.capabilities.len(),
            "Worker registered"
        );
        self.workers.insert(
            worker_id.clone(),
            WorkerRecord {
                registration,
                owner: owner.to_string(),
                last_seen: Instant::now(),
            },
        );
        Ok(Ack { worker_id })
    }

    /// Apply a heartbeat
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AuthorityError> {
        self.heartbeats_received.fetch_add(1, Ordering::SeqCst);

        let delay = self.heartbeat_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut record = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| AuthorityError::UnknownWorker(worker_id.to_string()))?;
        if record.registration.status == WorkerStatus::Deregistered {
            return Err(AuthorityError::UnknownWorker(worker_id.to_string()));
        }

        record.registration.status = request.status;
        record.registration.load_score = request.load_score.clamp(0.0, 1.0);
        record.registration.last_heartbeat_at = Some(Utc::now());
        record.last_seen = Instant::now();
        drop(record);

        let action = if self.pending_deregister.remove(worker_id).is_some() {
            info!(worker_id = %worker_id, "Instructing worker to deregister");
            HeartbeatAction::Deregister
        } else {
            HeartbeatAction::Ack
        };
        debug!(worker_id = %worker_id, status = %request.status, "Heartbeat");
        Ok(HeartbeatResponse { action })
    }

    /// Remove a worker from routing; acknowledged whether or not it was known
    pub fn deregister(&self, worker_id: &str) -> Ack {
        if let Some(mut record) = self.workers.get_mut(worker_id) {
            if record.registration.status != WorkerStatus::Deregistered {
                record.registration.status = WorkerStatus::Deregistered;
                info!(worker_id = %worker_id, "Worker deregistered");
            }
        }
        self.pending_deregister.remove(worker_id);
        Ack {
            worker_id: worker_id.to_string(),
        }
    }

    /// Mark workers whose heartbeats stopped as Unreachable
    ///
    /// Returns the ids that changed.
    pub fn sweep_unreachable(&self) -> Vec<String> {
        let now = Instant::now();
        let mut changed = Vec::new();
        for mut entry in self.workers.iter_mut() {
            let status = entry.registration.status;
            if matches!(status, WorkerStatus::Deregistered | WorkerStatus::Unreachable) {
                continue;
            }
            if now.duration_since(entry.last_seen) > self.config.unreachable_after {
                entry.registration.status = WorkerStatus::Unreachable;
                changed.push(entry.key().clone());
            }
        }
        for worker_id in &changed {
            warn!(worker_id = %worker_id, "Worker unreachable");
        }
        changed
    }

    /// Registration snapshot
    pub fn worker(&self, worker_id: &str) -> Option<WorkerRegistration> {
        self.workers.get(worker_id).map(|r| r.registration.clone())
    }

    /// All registrations
    pub fn workers(&self) -> Vec<WorkerRegistration> {
        let mut all: Vec<_> = self
            .workers
            .iter()
            .map(|r| r.registration.clone())
            .collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    /// Answer the worker's next heartbeat with a deregister instruction
    pub fn instruct_deregister(&self, worker_id: &str) {
        self.pending_deregister.insert(worker_id.to_string());
    }

    /// Delay every heartbeat response
    pub fn set_heartbeat_delay(&self, delay: Duration) {
        self.heartbeat_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of certificates signed
    pub fn certificates_issued(&self) -> u64 {
        self.certificates_issued.load(Ordering::SeqCst)
    }

    /// Number of heartbeats received, including failed ones
    pub fn heartbeats_received(&self) -> u64 {
        self.heartbeats_received.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_pki::WorkerCertRequest;

    fn state() -> AuthorityState {
        AuthorityState::new(
            CertificateAuthority::new("Test CA").unwrap(),
            AuthorityConfig::default(),
        )
    }

    fn csr(service: &str) -> CsrRequest {
        let req = WorkerCertRequest::new(service, &[]).unwrap();
        CsrRequest {
            service_name: service.to_string(),
            csr_pem: req.csr_pem().to_string(),
            requested_sans: vec![],
        }
    }

    fn registration(worker_id: &str, endpoint: &str) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker_id.to_string(),
            service_type: "ocr".to_string(),
            capabilities: vec![],
            endpoint: endpoint.to_string(),
            status: WorkerStatus::Starting,
            load_score: 0.0,
            last_heartbeat_at: None,
        }
    }

    fn heartbeat(worker_id: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            worker_id: worker_id.to_string(),
            status: WorkerStatus::Healthy,
            load_score: 0.25,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn valid_token_gets_certificate() {
        let state = state();
        let token = state.issue_token("ocr").unwrap();
        let resp = state.sign(token.as_str(), &csr("ocr")).unwrap();
        assert!(resp.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(resp.ca_chain_pem, vec![state.ca_cert_pem().to_string()]);
        assert_eq!(state.certificates_issued(), 1);

        // Same token works again for renewal
        assert!(state.sign(token.as_str(), &csr("ocr")).is_ok());
    }

    #[test]
    fn unknown_token_is_unauthorized() {
        let state = state();
        let stranger = BootstrapToken::generate().unwrap();
        assert!(matches!(
            state.sign(stranger.as_str(), &csr("ocr")),
            Err(AuthorityError::Unauthorized)
        ));
        assert!(matches!(
            state.sign("%%%", &csr("ocr")),
            Err(AuthorityError::Unauthorized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_unauthorized() {
        let state = AuthorityState::new(
            CertificateAuthority::new("Test CA").unwrap(),
            AuthorityConfig {
                token_ttl: Duration::from_secs(10),
                ..Default::default()
            },
        );
        let token = state.issue_token("ocr").unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            state.sign(token.as_str(), &csr("ocr")),
            Err(AuthorityError::Unauthorized)
        ));
    }

    /// Story: a token for one service cannot mint another service's identity
    #[test]
    fn story_token_bound_to_service_identity() {
        let state = state();
        let token = state.issue_token("ocr").unwrap();

        // Claiming a different service outright
        assert!(matches!(
            state.sign(token.as_str(), &csr("billing")),
            Err(AuthorityError::IdentityConflict(_))
        ));

        // Claiming the right service with a CSR for another subject
        let mut sneaky = csr("billing");
        sneaky.service_name = "ocr".to_string();
        assert!(matches!(
            state.sign(token.as_str(), &sneaky),
            Err(AuthorityError::IdentityConflict(_))
        ));
    }

    #[test]
    fn garbage_csr_is_invalid() {
        let state = state();
        let token = state.issue_token("ocr").unwrap();
        let bad = CsrRequest {
            service_name: "ocr".into(),
            csr_pem: "nope".into(),
            requested_sans: vec![],
        };
        assert!(matches!(
            state.sign(token.as_str(), &bad),
            Err(AuthorityError::InvalidCsr(_))
        ));
    }

    #[test]
    fn duplicate_live_worker_id_rejected_but_restart_allowed() {
        let state = state();
        state.register("ocr", registration("ocr-0", "https://a:8443")).unwrap();

        // Same endpoint re-registering (restart)
        assert!(state.register("ocr", registration("ocr-0", "https://a:8443")).is_ok());

        // Different endpoint while the first is live
        assert!(matches!(
            state.register("ocr", registration("ocr-0", "https://b:8443")),
            Err(AuthorityError::DuplicateWorkerId(_))
        ));

        // After deregistration the id is free
        state.deregister("ocr-0");
        assert!(state.register("ocr", registration("ocr-0", "https://b:8443")).is_ok());
    }

    #[test]
    fn worker_ids_never_move_between_services() {
        let state = state();
        state.register("ocr", registration("ocr-a-0", "https://a:8443")).unwrap();
        state.deregister("ocr-a-0");

        assert!(matches!(
            state.register("ocr-a", registration("ocr-a-0", "https://a:8443")),
            Err(AuthorityError::Forbidden(_))
        ));
        assert!(state.check_owner("ocr-a", "ocr-a-0").is_err());
        assert!(state.check_owner("ocr", "ocr-a-0").is_ok());
        assert!(state.check_owner("anyone", "never-seen").is_ok());
    }

    #[test]
    fn unsupported_service_type_rejected() {
        let state = AuthorityState::new(
            CertificateAuthority::new("Test CA").unwrap(),
            AuthorityConfig {
                supported_service_types: Some(["classifier".to_string()].into()),
                ..Default::default()
            },
        );
        assert!(matches!(
            state.register("ocr", registration("ocr-0", "https://a:8443")),
            Err(AuthorityError::UnsupportedServiceType(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_updates_registration() {
        let state = state();
        state.register("ocr", registration("ocr-0", "https://a:8443")).unwrap();

        let resp = state.heartbeat("ocr-0", &heartbeat("ocr-0")).await.unwrap();
        assert_eq!(resp.action, HeartbeatAction::Ack);

        let reg = state.worker("ocr-0").unwrap();
        assert_eq!(reg.status, WorkerStatus::Healthy);
        assert_eq!(reg.load_score, 0.25);
        assert!(reg.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_worker_fails() {
        let state = state();
        assert!(matches!(
            state.heartbeat("ghost-0", &heartbeat("ghost-0")).await,
            Err(AuthorityError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn deregister_instruction_delivered_once() {
        let state = state();
        state.register("ocr", registration("ocr-0", "https://a:8443")).unwrap();
        state.instruct_deregister("ocr-0");

        let first = state.heartbeat("ocr-0", &heartbeat("ocr-0")).await.unwrap();
        assert_eq!(first.action, HeartbeatAction::Deregister);
        let second = state.heartbeat("ocr-0", &heartbeat("ocr-0")).await.unwrap();
        assert_eq!(second.action, HeartbeatAction::Ack);
    }

    #[test]
    fn deregister_is_idempotent() {
        let state = state();
        state.register("ocr", registration("ocr-0", "https://a:8443")).unwrap();
        assert_eq!(state.deregister("ocr-0").worker_id, "ocr-0");
        assert_eq!(state.deregister("ocr-0").worker_id, "ocr-0");
        assert_eq!(state.deregister("never-seen").worker_id, "never-seen");
        assert_eq!(
            state.worker("ocr-0").unwrap().status,
            WorkerStatus::Deregistered
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_workers_become_unreachable() {
        let state = AuthorityState::new(
            CertificateAuthority::new("Test CA").unwrap(),
            AuthorityConfig {
                unreachable_after: Duration::from_secs(30),
                ..Default::default()
            },
        );
        state.register("ocr", registration("ocr-0", "https://a:8443")).unwrap();
        assert!(state.sweep_unreachable().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(state.sweep_unreachable(), vec!["ocr-0".to_string()]);
        assert_eq!(
            state.worker("ocr-0").unwrap().status,
            WorkerStatus::Unreachable
        );
    }
}
