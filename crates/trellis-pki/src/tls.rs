//! rustls configuration backed by the certificate store
//!
//! Servers never load a certificate once at startup. They resolve it per
//! handshake from the [`CertificateStore`], so a renewed bundle is picked up by
//! the next handshake while handshakes already in flight finish with the
//! `Arc<CertifiedKey>` they resolved.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tracing::warn;

use crate::bundle::CertificateBundle;
use crate::pki::unix_now;
use crate::store::CertificateStore;

/// TLS setup errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// A certificate PEM could not be parsed
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The private key could not be parsed or is unsupported
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// rustls rejected the configuration
    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

/// The crypto provider used for every Trellis TLS endpoint
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Parse every certificate in a PEM string
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(
            "no certificates found in PEM".to_string(),
        ));
    }
    Ok(certs)
}

/// Build the rustls signing key and chain for a bundle
pub fn certified_key(bundle: &CertificateBundle) -> Result<Arc<CertifiedKey>, TlsError> {
    let chain = parse_certificates(&bundle.full_chain_pem())?;
    let key = PrivateKeyDer::from_pem_slice(bundle.private_key_pem().as_bytes())
        .map_err(|e| TlsError::InvalidKey(e.to_string()))?;
    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(key)
        .map_err(|e| TlsError::InvalidKey(e.to_string()))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Root store trusting the given CA certificates
pub fn root_store(trust_chain_pem: &[String]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for pem in trust_chain_pem {
        for cert in parse_certificates(pem)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        }
    }
    Ok(roots)
}

/// Server certificate resolver reading the store on every handshake
///
/// Refuses the handshake (returns no certificate) when the store is empty or
/// the active certificate has expired.
#[derive(Debug)]
pub struct StoreCertResolver {
    store: Arc<CertificateStore>,
}

impl StoreCertResolver {
    /// Resolver over a store
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }

    /// Key that the next handshake would be served with
    pub fn current_key(&self) -> Option<Arc<CertifiedKey>> {
        let installed = self.store.current()?;
        let info = installed.bundle().info();
        if unix_now() > info.not_after {
            warn!(
                serial = %info.serial,
                not_after = info.not_after,
                "Refusing handshake: certificate expired"
            );
            return None;
        }
        Some(installed.certified_key())
    }
}

impl ResolvesServerCert for StoreCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current_key()
    }
}

/// How a server treats client certificates
#[derive(Debug, Clone)]
pub enum ClientAuth {
    /// Client certificates signed by these CAs are required
    Required(Vec<String>),
    /// Client certificates are verified against these CAs when presented
    Optional(Vec<String>),
    /// Client certificates are not requested
    Disabled,
}

/// Server config resolving its certificate from the store
pub fn server_config(
    store: Arc<CertificateStore>,
    client_auth: ClientAuth,
) -> Result<ServerConfig, TlsError> {
    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let builder = match client_auth {
        ClientAuth::Disabled => builder.with_no_client_auth(),
        ClientAuth::Required(chain) | ClientAuth::Optional(chain) if chain.is_empty() => {
            return Err(TlsError::Config(
                "client authentication needs at least one trusted CA".to_string(),
            ))
        }
        ClientAuth::Required(chain) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(&chain)?), provider)
                    .build()
                    .map_err(|e| TlsError::Config(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        ClientAuth::Optional(chain) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(&chain)?), provider)
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| TlsError::Config(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut config = builder.with_cert_resolver(Arc::new(StoreCertResolver::new(store)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
