//! Shared fixtures: a running authority and worker configuration pointing at it

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::sync::watch;

use trellis_authority::{serve, AuthorityConfig, AuthorityState, RunningAuthority};
use trellis_common::config::{vars, WorkerConfig};
use trellis_common::retry::RetryConfig;
use trellis_pki::{CertificateAuthority, CertificateBundle, WorkerCertRequest};
use trellis_worker::{WorkerOptions, WorkerPhase};

/// Token accepted on the worker's process endpoint
pub const CALLER_TOKEN: &str = "gw-secret";

pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Authority on an ephemeral port, with its CA written to a file
pub struct Fixture {
    pub authority: RunningAuthority,
    pub ca_file: NamedTempFile,
    pub token: String,
}

impl Fixture {
    pub async fn start() -> Self {
        install_crypto_provider();
        let ca = CertificateAuthority::new("Loopback Test CA").unwrap();
        let state = Arc::new(AuthorityState::new(ca, AuthorityConfig::default()));
        let token = state.issue_token("classifier").unwrap().to_string();

        let mut ca_file = NamedTempFile::new().unwrap();
        ca_file.write_all(state.ca_cert_pem().as_bytes()).unwrap();

        let authority = serve(
            state,
            "127.0.0.1:0".parse().unwrap(),
            &["localhost", "127.0.0.1"],
        )
        .await
        .unwrap();

        Self {
            authority,
            ca_file,
            token,
        }
    }

    pub fn state(&self) -> &Arc<AuthorityState> {
        self.authority.state()
    }

    /// Worker configuration read the same way the binary reads it
    pub fn worker_config(&self, instance: &str) -> WorkerConfig {
        config_for(&self.authority.url(), &self.token, Some(&self.ca_file), instance)
    }

    /// Client holding a mesh certificate, as the platform would
    pub fn mesh_client(&self) -> reqwest::Client {
        let state = self.state();
        let request = WorkerCertRequest::new("platform", &[]).unwrap();
        let cert = state
            .ca()
            .sign_csr(request.csr_pem(), "platform", &[], Duration::from_secs(600))
            .unwrap();
        let bundle = CertificateBundle::new(
            request.into_private_key(),
            cert,
            vec![state.ca_cert_pem().to_string()],
            "platform",
        )
        .unwrap();

        reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(
                reqwest::Certificate::from_pem(state.ca_cert_pem().as_bytes()).unwrap(),
            )
            .identity(reqwest::Identity::from_pem(bundle.identity_pem().as_bytes()).unwrap())
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }
}

pub fn config_for(
    authority_url: &str,
    token: &str,
    ca_file: Option<&NamedTempFile>,
    instance: &str,
) -> WorkerConfig {
    let mut env: HashMap<String, String> = HashMap::new();
    env.insert(vars::SERVICE_NAME.into(), "classifier".into());
    env.insert(vars::INSTANCE_ID.into(), instance.into());
    env.insert(vars::AUTHORITY_URL.into(), authority_url.into());
    env.insert(vars::BOOTSTRAP_TOKEN.into(), token.into());
    env.insert(vars::LISTEN_ADDR.into(), "127.0.0.1:0".into());
    env.insert(vars::HEALTH_ADDR.into(), "127.0.0.1:0".into());
    env.insert(vars::CERT_SANS.into(), "localhost".into());
    env.insert(
        vars::API_TOKENS.into(),
        format!("gateway::{}", CALLER_TOKEN),
    );
    env.insert(vars::SHUTDOWN_GRACE_SECS.into(), "1".into());
    if let Some(file) = ca_file {
        env.insert(
            vars::AUTHORITY_CA_FILE.into(),
            file.path().display().to_string(),
        );
    }
    WorkerConfig::from_env(&env).unwrap()
}

/// Options with short timeouts and a small retry budget
pub fn fast_options() -> WorkerOptions {
    WorkerOptions {
        acquisition_retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        },
        request_timeout: Duration::from_millis(500),
        deregister_timeout: Duration::from_millis(500),
        ..WorkerOptions::default()
    }
}

/// An address nothing listens on
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Wait until the phase matches, failing the test after `limit`
pub async fn wait_for_phase(
    mut phases: watch::Receiver<WorkerPhase>,
    want: WorkerPhase,
    limit: Duration,
) {
    tokio::time::timeout(limit, phases.wait_for(|p| *p == want))
        .await
        .unwrap_or_else(|_| panic!("worker never reached {}", want))
        .unwrap();
}

pub fn mesh_url(addr: SocketAddr, path: &str) -> String {
    format!("https://localhost:{}{}", addr.port(), path)
}
