//! Caller identity from the TLS connection
//!
//! The listener accepts connections with or without a client certificate
//! because CSR submission happens before a worker has one. A certificate, when
//! presented, has already been verified against the CA by rustls;
//! [`PeerCertAcceptor`] reads the service it names and attaches a
//! [`PeerIdentity`] to every request on that connection. Registry handlers
//! extract [`PeerIdentity`] and reject requests without it.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::middleware::AddExtension;
use axum::Extension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsAcceptor;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tower::Layer;
use tracing::debug;

use trellis_pki::service_identity;

use crate::error::AuthorityError;

/// Service named by a verified client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Service from the worker common name
    pub service: String,
}

/// What the connection presented; `None` for anonymous or non-worker peers
#[derive(Debug, Clone, Default)]
pub struct ConnectionPeer(pub Option<PeerIdentity>);

impl PeerIdentity {
    /// Identity carried by a DER leaf, if it is a worker certificate
    pub fn from_der(der: &[u8]) -> Option<Self> {
        service_identity(der)
            .ok()
            .map(|service| Self { service })
    }

    /// Whether this peer may act for `worker_id` (`<service>-<instance>`)
    pub fn owns_worker_id(&self, worker_id: &str) -> bool {
        worker_id
            .strip_prefix(self.service.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|instance| !instance.is_empty())
    }

    /// [`Self::owns_worker_id`] as a result
    pub fn authorize(&self, worker_id: &str) -> Result<(), AuthorityError> {
        if self.owns_worker_id(worker_id) {
            Ok(())
        } else {
            Err(AuthorityError::Forbidden(format!(
                "certificate for service '{}' cannot act for worker '{}'",
                self.service, worker_id
            )))
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for PeerIdentity {
    type Rejection = AuthorityError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ConnectionPeer>()
            .and_then(|peer| peer.0.clone())
            .ok_or(AuthorityError::MissingClientCertificate)
    }
}

/// TLS acceptor that records the peer's worker identity on each connection
#[derive(Debug, Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    /// Wrap a rustls acceptor
    pub fn new(inner: RustlsAcceptor) -> Self {
        Self { inner }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = <RustlsAcceptor as Accept<I, S>>::Stream;
    type Service = AddExtension<S, ConnectionPeer>;
    type Future = BoxFuture<'static, std::io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let peer = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|chain| chain.first())
                .and_then(|leaf| PeerIdentity::from_der(leaf.as_ref()));
            debug!(peer = ?peer, "TLS connection accepted");
            Ok((stream, Extension(ConnectionPeer(peer)).layer(service)))
        })
    }
}
