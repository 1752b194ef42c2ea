//! PKI operations for worker identity certificates
//!
//! The authority holds a CA and signs CSRs; it never sees a worker's private key.
//!
//! # Security Model
//!
//! - The authority generates and holds the CA key pair
//! - Workers generate their own key pairs locally
//! - Workers send only CSRs (public key + claimed identity)
//! - The authority checks the claimed identity against the CSR subject, then
//!   signs a short-lived certificate usable for both client and server auth
//! - Workers verify what comes back (chain, public key, identity, validity)
//!   before installing it
//!
//! # Identity
//!
//! A worker for service `ocr` has subject CN `trellis-worker-ocr` and a DNS
//! SAN `ocr`. See [`worker_common_name`] and [`service_from_common_name`].

use std::fmt::Display;
use std::net::IpAddr;
use std::time::Duration;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;
use zeroize::Zeroizing;

/// CA certificates live ten years
pub const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Worker certificates live a day unless configured otherwise
pub const DEFAULT_WORKER_CERT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Issued certificates are backdated by this much to tolerate clock skew
pub const NOT_BEFORE_BACKDATE: Duration = Duration::from_secs(60);

/// Share of the lifetime after which renewal starts when the configured
/// margin is longer than the certificate lives
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Prefix of every worker certificate's common name
pub const WORKER_CN_PREFIX: &str = "trellis-worker-";

/// Organization placed in every subject
pub const ORGANIZATION: &str = "Trellis";

/// Subject CN of the authority's own TLS certificate
pub const AUTHORITY_COMMON_NAME: &str = "Trellis Authority";

/// Common name for a service's worker certificate
pub fn worker_common_name(service_name: &str) -> String {
    format!("{WORKER_CN_PREFIX}{service_name}")
}

/// Service name encoded in a worker certificate's common name
pub fn service_from_common_name(common_name: &str) -> Option<&str> {
    match common_name.strip_prefix(WORKER_CN_PREFIX) {
        Some("") | None => None,
        Some(service) => Some(service),
    }
}

/// Current Unix time in seconds
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `[now - backdate, now + ttl]`
fn validity_window(ttl: Duration, backdate: Duration) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    (now - backdate, now + ttl)
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// CSR is unreadable or its self-signature is wrong
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// CSR subject differs from the claimed identity
    #[error("identity conflict: CSR names '{actual}', caller claimed '{expected}'")]
    IdentityConflict {
        /// Identity the caller claimed
        expected: String,
        /// Identity found in the CSR
        actual: String,
    },

    /// rcgen could not build or sign something
    #[error("could not build {0}")]
    Generation(String),

    /// No key pair could be generated
    #[error("could not generate {0}")]
    KeyGeneration(String),

    /// Chain of trust did not verify
    #[error("chain validation failed: {0}")]
    ChainValidation(String),

    /// Certificate public key differs from the CSR's
    #[error("certificate public key does not match the CSR")]
    PublicKeyMismatch,

    /// Certificate names a different identity than expected
    #[error("certificate identity mismatch: expected '{expected}', got '{actual}'")]
    IdentityMismatch {
        /// Expected common name
        expected: String,
        /// Common name found in the certificate
        actual: String,
    },

    /// Certificate not valid at the checked time
    #[error("certificate outside validity window: {0}")]
    ValidityWindow(String),

    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// PEM, DER or key material could not be read
    #[error("malformed {0}")]
    Parse(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

fn malformed<E: Display>(what: &'static str) -> impl FnOnce(E) -> PkiError {
    move |e| PkiError::Parse(format!("{what}: {e}"))
}

fn unbuildable<E: Display>(what: &'static str) -> impl FnOnce(E) -> PkiError {
    move |e| PkiError::Generation(format!("{what}: {e}"))
}

fn fresh_key(purpose: &'static str) -> Result<KeyPair> {
    KeyPair::generate().map_err(|e| PkiError::KeyGeneration(format!("{purpose} key: {e}")))
}

/// DER contents of the first PEM block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    ::pem::parse(pem_data)
        .map(|block| block.into_contents())
        .map_err(malformed("PEM"))
}

fn parse_x509<'a>(der: &'a [u8], what: &'static str) -> Result<X509Certificate<'a>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(malformed(what))
}

fn common_name_of(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .find_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .unwrap_or_default()
}

/// Information about a certificate's validity and renewal schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Serial number, hex
    pub serial: String,
}

impl CertificateInfo {
    /// Read a PEM certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        Self::from_der(&parse_pem(pem_data)?)
    }

    /// Read a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self::of(&parse_x509(der, "certificate")?))
    }

    fn of(cert: &X509Certificate<'_>) -> Self {
        let validity = cert.validity();
        Self {
            not_before: validity.not_before.timestamp(),
            not_after: validity.not_after.timestamp(),
            common_name: common_name_of(cert.subject()),
            serial: cert.raw_serial_as_string(),
        }
    }

    /// `not_after - not_before`, in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining until expiry at `now`
    pub fn remaining_secs_at(&self, now: i64) -> i64 {
        self.not_after - now
    }

    /// Seconds left before expiry
    pub fn remaining_secs(&self) -> i64 {
        self.remaining_secs_at(unix_now())
    }

    /// `not_before <= now <= not_after`
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Fraction of lifetime elapsed at `now` (0.0 to 1.0+)
    pub fn lifetime_fraction_at(&self, now: i64) -> f64 {
        let lifetime = self.lifetime_secs().max(1) as f64;
        (now - self.not_before) as f64 / lifetime
    }

    /// Unix time at which renewal should start
    ///
    /// `not_after - margin` when that is after `not_before`; otherwise the
    /// point at [`ROTATION_THRESHOLD`] of the lifetime. Always strictly
    /// before `not_after` for a certificate with positive lifetime.
    pub fn renewal_deadline(&self, margin: Duration) -> i64 {
        let margin = (margin.as_secs() as i64).max(1);
        let by_margin = self.not_after - margin;
        if by_margin > self.not_before {
            by_margin
        } else {
            self.not_before + (self.lifetime_secs() as f64 * ROTATION_THRESHOLD) as i64
        }
    }

    /// Whether renewal is due at `now`
    pub fn needs_renewal_at(&self, now: i64, margin: Duration) -> bool {
        now >= self.renewal_deadline(margin)
    }
}

/// Public key and subject extracted from a verified CSR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    /// Subject common name
    pub common_name: String,
    /// Raw subject public key bits
    pub public_key: Vec<u8>,
}

/// Parse a CSR and verify its self-signature
pub fn inspect_csr(csr_pem: &str) -> Result<CsrInfo> {
    let invalid = |e: PkiError| PkiError::InvalidCsr(e.to_string());
    let der = parse_pem(csr_pem).map_err(invalid)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| invalid(malformed("CSR")(e)))?;
    csr.verify_signature()
        .map_err(|e| PkiError::InvalidCsr(format!("self-signature does not verify: {e}")))?;

    let info = &csr.certification_request_info;
    let public_key: &[u8] = &info.subject_pki.subject_public_key.data;
    Ok(CsrInfo {
        common_name: common_name_of(&info.subject),
        public_key: public_key.to_vec(),
    })
}

fn subject_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for (kind, value) in [
        (DnType::CommonName, common_name),
        (DnType::OrganizationName, ORGANIZATION),
    ] {
        dn.push(kind, DnValue::Utf8String(value.to_owned()));
    }
    dn
}

/// Non-CA profile shared by every certificate the authority issues
fn apply_leaf_profile(
    params: &mut CertificateParams,
    subject: &str,
    usages: Vec<ExtendedKeyUsagePurpose>,
    ttl: Duration,
) {
    params.distinguished_name = subject_name(subject);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = usages;
    (params.not_before, params.not_after) = validity_window(ttl, NOT_BEFORE_BACKDATE);
}

/// Turn SAN strings into rcgen SANs; IP literals become IP SANs
pub fn parse_sans<S: AsRef<str>>(sans: &[S]) -> Result<Vec<SanType>> {
    let to_san = |san: &str| match san.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => Ia5String::try_from(san)
            .map(SanType::DnsName)
            .map_err(|e| PkiError::Generation(format!("SAN '{san}': {e}"))),
    };
    sans.iter().map(|san| to_san(san.as_ref())).collect()
}

/// Service name first, then requested extras without duplicates
fn worker_sans(service_name: &str, requested: &[String]) -> Vec<String> {
    let mut sans = vec![service_name.to_string()];
    for san in requested {
        if !sans.contains(san) {
            sans.push(san.clone());
        }
    }
    sans
}

/// Certificate Authority for signing worker CSRs
#[derive(Clone)]
pub struct CertificateAuthority {
    key_pem: Zeroizing<String>,
    cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Self-signed CA with a fresh key
    pub fn new(common_name: &str) -> Result<Self> {
        let key = fresh_key("CA")?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        (params.not_before, params.not_after) = validity_window(CA_VALIDITY, Duration::ZERO);

        let cert = params
            .self_signed(&key)
            .map_err(unbuildable("CA certificate"))?;
        Ok(Self {
            key_pem: Zeroizing::new(key.serialize_pem()),
            cert_pem: cert.pem(),
        })
    }

    /// Restore a CA persisted as PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem).map_err(malformed("CA key"))?;
        parse_x509(&parse_pem(cert_pem)?, "CA certificate")?;
        Ok(Self {
            key_pem: Zeroizing::new(key_pem.to_owned()),
            cert_pem: cert_pem.to_owned(),
        })
    }

    /// CA certificate, handed to workers as their trust chain
    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key
    pub fn ca_key_pem(&self) -> &str {
        &self.key_pem
    }

    fn signing_key(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem).map_err(malformed("CA key"))
    }

    /// Server certificate for the authority's own HTTPS endpoint
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn generate_server_cert(&self, sans: &[&str]) -> Result<(String, Zeroizing<String>)> {
        let key = fresh_key("server")?;

        let mut params = CertificateParams::default();
        apply_leaf_profile(
            &mut params,
            AUTHORITY_COMMON_NAME,
            vec![ExtendedKeyUsagePurpose::ServerAuth],
            CA_VALIDITY / 10,
        );
        params.subject_alt_names = parse_sans(sans)?;

        let ca_key = self.signing_key()?;
        let issuer =
            Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).map_err(malformed("CA issuer"))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(unbuildable("server certificate"))?;
        Ok((cert.pem(), Zeroizing::new(key.serialize_pem())))
    }

    /// Sign a worker CSR and return the certificate in PEM format
    ///
    /// The CSR subject must be the worker common name for `service_name`.
    /// Subject, extensions and validity are set here; only the public key
    /// is taken from the CSR.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        service_name: &str,
        requested_sans: &[String],
        ttl: Duration,
    ) -> Result<String> {
        let claimed = inspect_csr(csr_pem)?.common_name;
        let expected = worker_common_name(service_name);
        if claimed != expected {
            return Err(PkiError::IdentityConflict {
                expected,
                actual: claimed,
            });
        }

        let mut request = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(e.to_string()))?;
        apply_leaf_profile(
            &mut request.params,
            &expected,
            vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
            ],
            ttl,
        );
        request.params.subject_alt_names =
            parse_sans(&worker_sans(service_name, requested_sans))?;

        let ca_key = self.signing_key()?;
        let issuer =
            Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).map_err(malformed("CA issuer"))?;
        let cert = request
            .signed_by(&issuer)
            .map_err(unbuildable("worker certificate"))?;

        debug!(service = %service_name, ttl_secs = ttl.as_secs(), "Signed worker certificate");
        Ok(cert.pem())
    }
}

/// Worker-side key pair and CSR, generated locally
pub struct WorkerCertRequest {
    key_pem: Zeroizing<String>,
    csr_pem: String,
    public_key: Vec<u8>,
}

impl std::fmt::Debug for WorkerCertRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCertRequest")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

impl WorkerCertRequest {
    /// Fresh key pair and a CSR naming `service_name`
    pub fn new(service_name: &str, requested_sans: &[String]) -> Result<Self> {
        let key = fresh_key("worker")?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject_name(&worker_common_name(service_name));
        params.subject_alt_names = parse_sans(&worker_sans(service_name, requested_sans))?;

        let csr_pem = params
            .serialize_request(&key)
            .and_then(|csr| csr.pem())
            .map_err(unbuildable("CSR"))?;
        let public_key = inspect_csr(&csr_pem)?.public_key;

        Ok(Self {
            key_pem: Zeroizing::new(key.serialize_pem()),
            csr_pem,
            public_key,
        })
    }

    /// CSR in PEM format (sent to the authority)
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Raw public key bits embedded in the CSR
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Private key in PEM format (never leaves the process)
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Consume the request, keeping only the private key
    pub fn into_private_key(self) -> Zeroizing<String> {
        self.key_pem
    }
}

/// What an issued certificate must satisfy before it is installed
#[derive(Debug, Clone, Copy)]
pub struct IssuedCertificateExpectations<'a> {
    /// Service the certificate must name
    pub service_name: &'a str,
    /// Public key from the CSR that was submitted
    pub public_key: &'a [u8],
    /// Pre-provisioned root the chain must end at, if configured
    pub anchor_pem: Option<&'a str>,
    /// Time to check validity at (Unix seconds)
    pub now: i64,
}

/// Verify a certificate returned by the authority
///
/// Checks, in order: the chain of trust (leaf signed by `chain[0]`, each CA
/// signed by the next, the last either self-signed or signed by the anchor),
/// that the public key matches the CSR's, the subject identity, and the
/// validity window.
pub fn validate_issued_certificate(
    cert_pem: &str,
    chain_pem: &[String],
    expected: IssuedCertificateExpectations<'_>,
) -> Result<CertificateInfo> {
    let leaf_der = parse_pem(cert_pem)?;
    let leaf = parse_x509(&leaf_der, "certificate")?;

    if chain_pem.is_empty() {
        return Err(PkiError::ChainValidation("empty trust chain".to_string()));
    }
    let chain_ders = chain_pem
        .iter()
        .map(|pem| parse_pem(pem))
        .collect::<Result<Vec<_>>>()?;
    let chain = chain_ders
        .iter()
        .map(|der| parse_x509(der, "CA certificate"))
        .collect::<Result<Vec<_>>>()?;

    verify_signed_by(&leaf, &chain[0], "leaf")?;
    for (i, ca) in chain.iter().enumerate() {
        if !ca.is_ca() {
            return Err(PkiError::ChainValidation(format!(
                "chain[{}] is not a CA certificate",
                i
            )));
        }
        let validity = ca.validity();
        if expected.now < validity.not_before.timestamp()
            || expected.now > validity.not_after.timestamp()
        {
            return Err(PkiError::ChainValidation(format!(
                "chain[{}] is outside its validity window",
                i
            )));
        }
        if let Some(parent) = chain.get(i + 1) {
            verify_signed_by(ca, parent, &format!("chain[{}]", i))?;
        }
    }

    let (last_index, last) = (chain.len() - 1, &chain[chain.len() - 1]);
    match expected.anchor_pem {
        Some(anchor_pem) => {
            let anchor_der = parse_pem(anchor_pem)?;
            if anchor_der != chain_ders[last_index] {
                let anchor = parse_x509(&anchor_der, "anchor certificate")?;
                verify_signed_by(last, &anchor, "chain root")?;
            }
        }
        None => verify_signed_by(last, last, "chain root")?,
    }

    let cert_key: &[u8] = &leaf.public_key().subject_public_key.data;
    if cert_key != expected.public_key {
        return Err(PkiError::PublicKeyMismatch);
    }

    let expected_cn = worker_common_name(expected.service_name);
    let actual_cn = common_name_of(leaf.subject());
    if actual_cn != expected_cn {
        return Err(PkiError::IdentityMismatch {
            expected: expected_cn,
            actual: actual_cn,
        });
    }

    let info = CertificateInfo::of(&leaf);
    if expected.now < info.not_before {
        return Err(PkiError::ValidityWindow(format!(
            "not valid until {} (now {})",
            info.not_before, expected.now
        )));
    }
    if expected.now > info.not_after {
        return Err(PkiError::ValidityWindow(format!(
            "expired at {} (now {})",
            info.not_after, expected.now
        )));
    }

    Ok(info)
}

fn verify_signed_by(
    cert: &X509Certificate<'_>,
    issuer: &X509Certificate<'_>,
    what: &str,
) -> Result<()> {
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|_| PkiError::ChainValidation(format!("{} signature verification failed", what)))
}

/// Service name carried by a DER worker certificate
pub fn service_identity(cert_der: &[u8]) -> Result<String> {
    let cn = common_name_of(parse_x509(cert_der, "certificate")?.subject());
    service_from_common_name(&cn)
        .map(str::to_string)
        .ok_or_else(|| PkiError::Parse(format!("worker CN '{cn}', expected {WORKER_CN_PREFIX}<service>")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expectations<'a>(req: &'a WorkerCertRequest, service: &'a str) -> IssuedCertificateExpectations<'a> {
        IssuedCertificateExpectations {
            service_name: service,
            public_key: req.public_key(),
            anchor_pem: None,
            now: unix_now(),
        }
    }

    #[test]
    fn worker_can_generate_csr() {
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();
        assert!(req.csr_pem().contains("BEGIN CERTIFICATE REQUEST"));
        assert!(req.private_key_pem().contains("BEGIN PRIVATE KEY"));

        let info = inspect_csr(req.csr_pem()).unwrap();
        assert_eq!(info.common_name, "trellis-worker-ocr");
        assert_eq!(info.public_key, req.public_key());
    }

    #[test]
    fn private_key_never_in_csr() {
        let req = WorkerCertRequest::new("ocr", &["ocr.mesh".to_string()]).unwrap();
        let key_body: String = req
            .private_key_pem()
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        assert!(!req.csr_pem().contains(&key_body));
        assert!(!req.csr_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn debug_redacts_private_keys() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        assert!(!format!("{:?}", ca).contains("PRIVATE KEY"));
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();
        assert!(!format!("{:?}", req).contains("PRIVATE KEY"));
    }

    /// Story: a worker requests, receives and validates its identity certificate
    #[test]
    fn story_complete_worker_certificate_issuance() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        let req = WorkerCertRequest::new("classifier", &["10.1.2.3".to_string()]).unwrap();

        let cert_pem = ca
            .sign_csr(
                req.csr_pem(),
                "classifier",
                &["10.1.2.3".to_string()],
                Duration::from_secs(3600),
            )
            .unwrap();

        let chain = vec![ca.ca_cert_pem().to_string()];
        let info =
            validate_issued_certificate(&cert_pem, &chain, expectations(&req, "classifier")).unwrap();

        assert_eq!(info.common_name, "trellis-worker-classifier");
        assert!(info.is_valid_at(unix_now()));
        assert!(info.lifetime_secs() >= 3600);
        assert_eq!(
            service_identity(&parse_pem(&cert_pem).unwrap()).unwrap(),
            "classifier"
        );
    }

    /// Story: a CSR claiming another service's identity is refused
    #[test]
    fn story_identity_conflict_rejected_by_authority() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();

        let err = ca
            .sign_csr(req.csr_pem(), "billing", &[], Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, PkiError::IdentityConflict { .. }));
    }

    #[test]
    fn malformed_csr_rejected() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        for bad in [
            "not a csr",
            "-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n",
        ] {
            let err = ca.sign_csr(bad, "ocr", &[], Duration::from_secs(60)).unwrap_err();
            assert!(matches!(err, PkiError::InvalidCsr(_)), "{bad}: {err}");
        }
    }

    /// Story: a certificate signed by a different CA fails chain validation
    #[test]
    fn story_cross_ca_certificate_rejected() {
        let real_ca = CertificateAuthority::new("Real CA").unwrap();
        let rogue_ca = CertificateAuthority::new("Rogue CA").unwrap();
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();

        let cert_pem = rogue_ca
            .sign_csr(req.csr_pem(), "ocr", &[], Duration::from_secs(3600))
            .unwrap();

        let chain = vec![real_ca.ca_cert_pem().to_string()];
        let err = validate_issued_certificate(&cert_pem, &chain, expectations(&req, "ocr"))
            .unwrap_err();
        assert!(matches!(err, PkiError::ChainValidation(_)));
    }

    #[test]
    fn anchor_must_match_chain_root() {
        let ca = CertificateAuthority::new("Real CA").unwrap();
        let other = CertificateAuthority::new("Other CA").unwrap();
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();
        let cert_pem = ca
            .sign_csr(req.csr_pem(), "ocr", &[], Duration::from_secs(3600))
            .unwrap();
        let chain = vec![ca.ca_cert_pem().to_string()];

        let pinned = IssuedCertificateExpectations {
            anchor_pem: Some(ca.ca_cert_pem()),
            ..expectations(&req, "ocr")
        };
        assert!(validate_issued_certificate(&cert_pem, &chain, pinned).is_ok());

        let wrong_pin = IssuedCertificateExpectations {
            anchor_pem: Some(other.ca_cert_pem()),
            ..expectations(&req, "ocr")
        };
        assert!(matches!(
            validate_issued_certificate(&cert_pem, &chain, wrong_pin),
            Err(PkiError::ChainValidation(_))
        ));
    }

    /// Story: the authority returns a certificate for a different key
    #[test]
    fn story_public_key_mismatch_detected() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        let submitted = WorkerCertRequest::new("ocr", &[]).unwrap();
        let other = WorkerCertRequest::new("ocr", &[]).unwrap();

        let cert_pem = ca
            .sign_csr(other.csr_pem(), "ocr", &[], Duration::from_secs(3600))
            .unwrap();
        let chain = vec![ca.ca_cert_pem().to_string()];

        let err = validate_issued_certificate(&cert_pem, &chain, expectations(&submitted, "ocr"))
            .unwrap_err();
        assert!(matches!(err, PkiError::PublicKeyMismatch));
    }

    #[test]
    fn identity_mismatch_detected() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();
        let cert_pem = ca
            .sign_csr(req.csr_pem(), "ocr", &[], Duration::from_secs(3600))
            .unwrap();
        let chain = vec![ca.ca_cert_pem().to_string()];

        let err = validate_issued_certificate(&cert_pem, &chain, expectations(&req, "billing"))
            .unwrap_err();
        assert!(matches!(err, PkiError::IdentityMismatch { .. }));
    }

    #[test]
    fn validity_window_checked_against_now() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();
        let cert_pem = ca
            .sign_csr(req.csr_pem(), "ocr", &[], Duration::from_secs(3600))
            .unwrap();
        let chain = vec![ca.ca_cert_pem().to_string()];

        let later = IssuedCertificateExpectations {
            now: unix_now() + 7200,
            ..expectations(&req, "ocr")
        };
        assert!(matches!(
            validate_issued_certificate(&cert_pem, &chain, later),
            Err(PkiError::ValidityWindow(_))
        ));
    }

    #[test]
    fn empty_chain_rejected() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();
        let cert_pem = ca
            .sign_csr(req.csr_pem(), "ocr", &[], Duration::from_secs(3600))
            .unwrap();
        assert!(matches!(
            validate_issued_certificate(&cert_pem, &[], expectations(&req, "ocr")),
            Err(PkiError::ChainValidation(_))
        ));
    }

    #[test]
    fn renewal_deadline_uses_margin_when_it_fits() {
        let info = CertificateInfo {
            not_before: 1_000,
            not_after: 1_000 + 3_600,
            common_name: "trellis-worker-ocr".into(),
            serial: "01".into(),
        };
        assert_eq!(info.renewal_deadline(Duration::from_secs(300)), 4_300);
        assert!(!info.needs_renewal_at(4_299, Duration::from_secs(300)));
        assert!(info.needs_renewal_at(4_300, Duration::from_secs(300)));
    }

    #[test]
    fn renewal_deadline_falls_back_to_lifetime_fraction() {
        let info = CertificateInfo {
            not_before: 0,
            not_after: 100,
            common_name: String::new(),
            serial: String::new(),
        };
        // Margin larger than the whole lifetime
        assert_eq!(info.renewal_deadline(Duration::from_secs(300)), 80);
        // Zero margin still renews before expiry
        assert!(info.renewal_deadline(Duration::ZERO) < info.not_after);
    }

    #[test]
    fn lifetime_fraction_tracks_elapsed_time() {
        let info = CertificateInfo {
            not_before: 100,
            not_after: 200,
            common_name: String::new(),
            serial: String::new(),
        };
        assert_eq!(info.lifetime_fraction_at(100), 0.0);
        assert_eq!(info.lifetime_fraction_at(180), 0.8);
        assert!(info.lifetime_fraction_at(250) > 1.0);
        assert_eq!(info.remaining_secs_at(150), 50);
    }

    #[test]
    fn ca_roundtrips_through_pem() {
        let ca = CertificateAuthority::new("Persisted CA").unwrap();
        let loaded = CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();
        let req = WorkerCertRequest::new("ocr", &[]).unwrap();
        let cert_pem = loaded
            .sign_csr(req.csr_pem(), "ocr", &[], Duration::from_secs(60))
            .unwrap();
        let chain = vec![ca.ca_cert_pem().to_string()];
        assert!(validate_issued_certificate(&cert_pem, &chain, expectations(&req, "ocr")).is_ok());

        assert!(CertificateAuthority::from_pem("garbage", ca.ca_key_pem()).is_err());
        assert!(CertificateAuthority::from_pem(ca.ca_cert_pem(), "garbage").is_err());
    }

    #[test]
    fn server_cert_carries_requested_sans() {
        let ca = CertificateAuthority::new("Trellis Test CA").unwrap();
        let (cert_pem, key_pem) = ca.generate_server_cert(&["localhost", "127.0.0.1"]).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("PRIVATE KEY"));
        let info = CertificateInfo::from_pem(&cert_pem).unwrap();
        assert_eq!(info.common_name, AUTHORITY_COMMON_NAME);
    }

    #[test]
    fn common_name_helpers() {
        assert_eq!(worker_common_name("ocr"), "trellis-worker-ocr");
        assert_eq!(service_from_common_name("trellis-worker-ocr"), Some("ocr"));
        assert_eq!(service_from_common_name("trellis-worker-"), None);
        assert_eq!(service_from_common_name("agent-x"), None);
    }
}
