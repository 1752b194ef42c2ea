//! Certificate acquisition and renewal
//!
//! # Acquisition
//!
//! 1. Generate a key pair locally (the private key never leaves the process)
//! 2. Build a CSR naming the service identity, requesting client and server auth
//! 3. Submit it to the authority with the bootstrap token
//! 4. Validate the chain of trust, public key, subject identity and validity window
//! 5. Install the bundle into the [`CertificateStore`]
//!
//! Only submission is retried; every other failure means something is wrong
//! with the authority or the deployment and is reported with the failed step.
//!
//! # Renewal
//!
//! The renewal task sleeps until the renewal deadline and re-runs the steps.
//! On failure the worker keeps serving with the still-valid certificate and
//! retries with backoff. If the certificate actually expires the store is
//! cleared, so the TLS listener refuses new handshakes until renewal succeeds.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_common::protocol::CsrRequest;
use trellis_common::retry::{jittered, retry_with_backoff_when, RetryConfig};
use trellis_common::{AcquisitionStep, Error, Result};
use trellis_pki::{
    unix_now, validate_issued_certificate, CertificateBundle, CertificateInfo, CertificateStore,
    InstalledBundle, IssuedCertificateExpectations, PkiError, WorkerCertRequest,
};

use crate::controller::CsrSubmitter;
use crate::health::{InternalHealth, CERTIFICATE_EXPIRED, RENEWAL_FAILING};

/// Settings for [`CertificateManager`]
#[derive(Debug, Clone)]
pub struct CertificateSettings {
    /// Service identity to request
    pub service_name: String,
    /// Extra SANs to request
    pub requested_sans: Vec<String>,
    /// Pre-provisioned root the issued chain must end at
    pub anchor_pem: Option<String>,
    /// Margin before `not_after` at which renewal starts
    pub renewal_margin: Duration,
    /// Retry policy for submission during initial acquisition
    pub acquisition_retry: RetryConfig,
    /// Backoff policy between failed renewals
    pub renewal_retry: RetryConfig,
}

impl CertificateSettings {
    /// Settings with default retry policies
    pub fn new(service_name: impl Into<String>, renewal_margin: Duration) -> Self {
        Self {
            service_name: service_name.into(),
            requested_sans: Vec::new(),
            anchor_pem: None,
            renewal_margin,
            acquisition_retry: RetryConfig::with_max_attempts(5),
            renewal_retry: RetryConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                ..RetryConfig::infinite()
            },
        }
    }
}

/// Obtains and renews the worker's identity certificate
pub struct CertificateManager {
    settings: CertificateSettings,
    submitter: Arc<dyn CsrSubmitter>,
    store: Arc<CertificateStore>,
    health: Arc<InternalHealth>,
    /// Root every issued chain must end at; fixed by the first acquisition
    /// when none is configured
    anchor: Mutex<Option<String>>,
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("service_name", &self.settings.service_name)
            .field("store", &self.store)
            .finish()
    }
}

fn pki_step(e: PkiError) -> Error {
    let step = match &e {
        PkiError::KeyGeneration(_) => AcquisitionStep::KeyGeneration,
        PkiError::Generation(_) | PkiError::InvalidCsr(_) => {
            AcquisitionStep::CsrGeneration
        }
        PkiError::PublicKeyMismatch => AcquisitionStep::PublicKeyMismatch,
        PkiError::IdentityMismatch { .. } | PkiError::IdentityConflict { .. } => {
            AcquisitionStep::IdentityMismatch
        }
        PkiError::ValidityWindow(_) => AcquisitionStep::ValidityWindow,
        PkiError::ChainValidation(_) | PkiError::Parse(_) => AcquisitionStep::ChainValidation,
        PkiError::Io(_) => AcquisitionStep::Storage,
    };
    Error::acquisition(step, e.to_string())
}

impl CertificateManager {
    /// Create a manager writing into `store`
    pub fn new(
        settings: CertificateSettings,
        submitter: Arc<dyn CsrSubmitter>,
        store: Arc<CertificateStore>,
        health: Arc<InternalHealth>,
    ) -> Self {
        let anchor = Mutex::new(settings.anchor_pem.clone());
        Self {
            settings,
            submitter,
            store,
            health,
            anchor,
        }
    }

    /// The store this manager writes to
    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Acquire the first certificate; called once before any listener opens
    ///
    /// Submission is retried within the acquisition retry budget. Any failure
    /// is fatal to startup.
    pub async fn initialize_certificates(&self) -> Result<Arc<InstalledBundle>> {
        info!(service = %self.settings.service_name, "Acquiring identity certificate");
        let bundle = retry_with_backoff_when(
            &self.settings.acquisition_retry,
            "acquire_certificate",
            || self.acquire(),
            |e: &Error| e.is_retryable(),
        )
        .await?;
        let installed = self.install(bundle)?;
        let info = installed.bundle().info();
        info!(
            service = %self.settings.service_name,
            serial = %info.serial,
            not_after = info.not_after,
            "Identity certificate installed"
        );
        Ok(installed)
    }

    /// Trust anchor the issued chain must end at
    ///
    /// The pre-provisioned root when configured, otherwise the root of the
    /// first bundle ever installed. Clearing the store does not reset it.
    pub fn anchor(&self) -> Option<String> {
        self.anchor.lock().clone()
    }

    /// Run steps 1 to 4 once, returning a validated bundle
    pub async fn acquire(&self) -> Result<CertificateBundle> {
        let service = &self.settings.service_name;

        let request = WorkerCertRequest::new(service, &self.settings.requested_sans)
            .map_err(pki_step)?;
        debug!(service = %service, "Generated key pair and CSR");

        let response = self
            .submitter
            .submit_csr(&CsrRequest {
                service_name: service.clone(),
                csr_pem: request.csr_pem().to_string(),
                requested_sans: self.settings.requested_sans.clone(),
            })
            .await?;

        let anchor = self.anchor();
        validate_issued_certificate(
            &response.certificate_pem,
            &response.ca_chain_pem,
            IssuedCertificateExpectations {
                service_name: service,
                public_key: request.public_key(),
                anchor_pem: anchor.as_deref(),
                now: unix_now(),
            },
        )
        .map_err(pki_step)?;

        CertificateBundle::new(
            request.into_private_key(),
            response.certificate_pem,
            response.ca_chain_pem,
            service.clone(),
        )
        .map_err(pki_step)
    }

    fn install(&self, bundle: CertificateBundle) -> Result<Arc<InstalledBundle>> {
        let installed = self
            .store
            .install(bundle)
            .map_err(|e| Error::acquisition(AcquisitionStep::Storage, e.to_string()))?;
        let mut anchor = self.anchor.lock();
        if anchor.is_none() {
            *anchor = installed.bundle().trust_chain_pem().last().cloned();
            debug!("Pinned the issuing root as trust anchor");
        }
        Ok(installed)
    }

    /// Time until the current certificate should be renewed; zero when there
    /// is no certificate or the deadline has passed
    pub fn until_renewal(&self) -> Duration {
        match self.store.current() {
            Some(installed) => {
                let deadline = installed
                    .bundle()
                    .info()
                    .renewal_deadline(self.settings.renewal_margin);
                secs_until(deadline)
            }
            None => Duration::ZERO,
        }
    }

    /// Fraction of the installed certificate's lifetime already used; zero
    /// when there is none
    pub fn lifetime_elapsed(&self) -> f64 {
        self.store
            .current()
            .map(|installed| installed.bundle().info().lifetime_fraction_at(unix_now()))
            .unwrap_or(0.0)
    }

    /// Acquire and install a replacement certificate
    pub async fn renew_once(&self) -> Result<Arc<InstalledBundle>> {
        let bundle = self.acquire().await?;
        let installed = self.install(bundle)?;
        self.health.resolve(RENEWAL_FAILING);
        self.health.resolve(CERTIFICATE_EXPIRED);
        let info = installed.bundle().info();
        info!(
            generation = installed.generation(),
            serial = %info.serial,
            not_after = info.not_after,
            "Identity certificate renewed"
        );
        Ok(installed)
    }

    /// Clear the store if the installed certificate has expired
    ///
    /// Returns true when the worker has no usable certificate.
    pub fn enforce_expiry(&self) -> bool {
        let Some(installed) = self.store.current() else {
            return true;
        };
        let info: &CertificateInfo = installed.bundle().info();
        if info.remaining_secs() <= 0 {
            error!(
                serial = %info.serial,
                not_after = info.not_after,
                "Identity certificate expired; refusing new connections until renewed"
            );
            self.store.clear();
            self.health.report(CERTIFICATE_EXPIRED);
            return true;
        }
        false
    }

    /// Background renewal loop; returns when cancelled
    pub async fn run_renewal(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures = 0u32;
        loop {
            let wait = self.until_renewal();
            debug!(
                wait_secs = wait.as_secs(),
                lifetime_elapsed = self.lifetime_elapsed(),
                "Next certificate renewal scheduled"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.renew_once().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.health.report(RENEWAL_FAILING);
                    warn!(
                        error = %e,
                        attempt = failures,
                        "Certificate renewal failed; still serving with current certificate"
                    );
                    self.enforce_expiry();

                    let mut delay = jittered(self.settings.renewal_retry.delay_for_attempt(failures));
                    if let Some(installed) = self.store.current() {
                        // Wake up at expiry so the store is cleared on time
                        let to_expiry = secs_until(installed.bundle().info().not_after);
                        if to_expiry > Duration::ZERO {
                            delay = delay.min(to_expiry);
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.enforce_expiry();
                }
            }
        }
    }
}

fn secs_until(unix_secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(unix_secs - unix_now()).unwrap_or(0))
}
