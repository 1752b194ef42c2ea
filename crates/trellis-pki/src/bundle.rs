//! The worker's identity: private key, certificate and trust chain

use std::fmt;

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::pki::{parse_pem, CertificateInfo, PkiError, Result};

/// A validated identity certificate with its private key
///
/// The private key is zeroized when the bundle is dropped. Bundles are
/// immutable; renewal produces a new bundle that replaces the old one in the
/// [`CertificateStore`](crate::store::CertificateStore).
#[derive(Clone)]
pub struct CertificateBundle {
    private_key_pem: Zeroizing<String>,
    certificate_pem: String,
    trust_chain_pem: Vec<String>,
    subject_identity: String,
    info: CertificateInfo,
    issued_at: DateTime<Utc>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("subject_identity", &self.subject_identity)
            .field("serial", &self.info.serial)
            .field("not_before", &self.info.not_before)
            .field("not_after", &self.info.not_after)
            .field("trust_chain_len", &self.trust_chain_pem.len())
            .field("issued_at", &self.issued_at)
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}

impl CertificateBundle {
    /// Assemble a bundle, checking that the key belongs to the certificate
    pub fn new(
        private_key_pem: Zeroizing<String>,
        certificate_pem: String,
        trust_chain_pem: Vec<String>,
        subject_identity: impl Into<String>,
    ) -> Result<Self> {
        let info = CertificateInfo::from_pem(&certificate_pem)?;
        let bundle = Self {
            private_key_pem,
            certificate_pem,
            trust_chain_pem,
            subject_identity: subject_identity.into(),
            info,
            issued_at: Utc::now(),
        };
        if !bundle.key_matches_certificate()? {
            return Err(PkiError::PublicKeyMismatch);
        }
        Ok(bundle)
    }

    /// Private key PEM
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Leaf certificate PEM
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// CA certificates, issuer first
    pub fn trust_chain_pem(&self) -> &[String] {
        &self.trust_chain_pem
    }

    /// Service name the certificate was issued for
    pub fn subject_identity(&self) -> &str {
        &self.subject_identity
    }

    /// Validity information
    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// When the bundle was installed locally
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Certificate followed by key, the format TLS client identities load from
    pub fn identity_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{}\n{}",
            self.certificate_pem.trim_end(),
            self.private_key_pem.as_str()
        ))
    }

    /// Leaf followed by the chain, for serving
    pub fn full_chain_pem(&self) -> String {
        let mut out = self.certificate_pem.trim_end().to_string();
        for ca in &self.trust_chain_pem {
            out.push('\n');
            out.push_str(ca.trim_end());
        }
        out.push('\n');
        out
    }

    /// Whether the private key's public half is the certificate's public key
    pub fn key_matches_certificate(&self) -> Result<bool> {
        let key = KeyPair::from_pem(&self.private_key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse private key: {}", e)))?;
        let der = parse_pem(&self.certificate_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;
        let cert_key: &[u8] = &cert.public_key().subject_public_key.data;
        Ok(cert_key == key.public_key_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{CertificateAuthority, WorkerCertRequest};
    use std::time::Duration;

    fn issue(ca: &CertificateAuthority, service: &str) -> (WorkerCertRequest, String) {
        let req = WorkerCertRequest::new(service, &[]).unwrap();
        let cert = ca
            .sign_csr(req.csr_pem(), service, &[], Duration::from_secs(3600))
            .unwrap();
        (req, cert)
    }

    #[test]
    fn bundle_accepts_matching_key() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let (req, cert) = issue(&ca, "ocr");
        let bundle = CertificateBundle::new(
            req.into_private_key(),
            cert,
            vec![ca.ca_cert_pem().to_string()],
            "ocr",
        )
        .unwrap();

        assert_eq!(bundle.subject_identity(), "ocr");
        assert_eq!(bundle.info().common_name, "trellis-worker-ocr");
        assert!(bundle.identity_pem().contains("BEGIN CERTIFICATE"));
        assert!(bundle.identity_pem().contains("PRIVATE KEY"));
        assert_eq!(bundle.full_chain_pem().matches("BEGIN CERTIFICATE").count(), 2);
    }

    #[test]
    fn bundle_rejects_foreign_key() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let (_, cert) = issue(&ca, "ocr");
        let stranger = WorkerCertRequest::new("ocr", &[]).unwrap();

        let err = CertificateBundle::new(
            stranger.into_private_key(),
            cert,
            vec![ca.ca_cert_pem().to_string()],
            "ocr",
        )
        .unwrap_err();
        assert!(matches!(err, PkiError::PublicKeyMismatch));
    }

    #[test]
    fn debug_never_prints_key() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let (req, cert) = issue(&ca, "ocr");
        let bundle = CertificateBundle::new(
            req.into_private_key(),
            cert,
            vec![ca.ca_cert_pem().to_string()],
            "ocr",
        )
        .unwrap();
        let rendered = format!("{:?}", bundle);
        assert!(!rendered.contains("PRIVATE KEY"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
