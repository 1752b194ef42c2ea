//! TLS server for the authority

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use axum_server::Handle;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use trellis_pki::{server_config, CertificateBundle, CertificateStore, ClientAuth};

use crate::peer::PeerCertAcceptor;
use crate::routes::authority_router;
use crate::state::AuthorityState;

/// Identity recorded for the authority's own server certificate
const AUTHORITY_IDENTITY: &str = "trellis-authority";

/// How often stale registrations are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Authority server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Server certificate generation or installation failed
    #[error("server certificate: {0}")]
    Certificate(String),

    /// TLS configuration failed
    #[error("TLS configuration: {0}")]
    TlsConfig(String),

    /// The listener never came up
    #[error("failed to bind {0}")]
    Bind(SocketAddr),
}

/// A running authority
pub struct RunningAuthority {
    local_addr: SocketAddr,
    state: Arc<AuthorityState>,
    handle: Handle,
    cancel: CancellationToken,
    server_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
    _store: Arc<CertificateStore>,
}

impl std::fmt::Debug for RunningAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningAuthority")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl RunningAuthority {
    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL for clients
    pub fn url(&self) -> String {
        format!("https://localhost:{}", self.local_addr.port())
    }

    /// Shared state
    pub fn state(&self) -> &Arc<AuthorityState> {
        &self.state
    }

    /// Stop accepting connections and wait for the server to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.handle.graceful_shutdown(Some(Duration::from_secs(2)));
        if let Err(e) = self.server_task.await {
            error!(error = %e, "Authority server task failed");
        }
        let _ = self.sweeper_task.await;
    }

    /// Wait until the server exits on its own
    pub async fn wait(self) {
        if let Err(e) = self.server_task.await {
            error!(error = %e, "Authority server task failed");
        }
        self.cancel.cancel();
        let _ = self.sweeper_task.await;
    }
}

/// Start the authority on `addr`
///
/// The server certificate is issued by the authority's own CA for `sans`.
/// Client certificates are optional at the TLS layer because CSR submission
/// happens before a worker has one; when presented they must chain to the CA,
/// and registry routes refuse requests from connections without one.
pub async fn serve(
    state: Arc<AuthorityState>,
    addr: SocketAddr,
    sans: &[&str],
) -> Result<RunningAuthority, ServerError> {
    let ca = state.ca();
    let (cert_pem, key_pem) = ca
        .generate_server_cert(sans)
        .map_err(|e| ServerError::Certificate(e.to_string()))?;
    let chain = vec![ca.ca_cert_pem().to_string()];
    let bundle = CertificateBundle::new(key_pem, cert_pem, chain.clone(), AUTHORITY_IDENTITY)
        .map_err(|e| ServerError::Certificate(e.to_string()))?;

    let store =
        Arc::new(CertificateStore::temporary().map_err(|e| ServerError::Certificate(e.to_string()))?);
    store
        .install(bundle)
        .map_err(|e| ServerError::Certificate(e.to_string()))?;

    let tls = server_config(store.clone(), ClientAuth::Optional(chain))
        .map_err(|e| ServerError::TlsConfig(e.to_string()))?;
    let tls_config = RustlsConfig::from_config(Arc::new(tls));

    let handle = Handle::new();
    let router = authority_router(state.clone());
    let server_handle = handle.clone();
    let acceptor = PeerCertAcceptor::new(RustlsAcceptor::new(tls_config));
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum_server::bind(addr)
            .acceptor(acceptor)
            .handle(server_handle)
            .serve(router.into_make_service())
            .await
        {
            error!(error = %e, "Authority HTTPS server error");
        }
    });

    let local_addr = handle.listening().await.ok_or(ServerError::Bind(addr))?;
    info!(addr = %local_addr, "Authority listening");

    let cancel = CancellationToken::new();
    let sweeper_task = tokio::spawn(sweep_loop(state.clone(), cancel.clone()));

    Ok(RunningAuthority {
        local_addr,
        state,
        handle,
        cancel,
        server_task,
        sweeper_task,
        _store: store,
    })
}

async fn sweep_loop(state: Arc<AuthorityState>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                state.sweep_unreachable();
            }
        }
    }
}
