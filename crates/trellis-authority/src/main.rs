//! Trellis reference authority - development CA and worker registry

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use trellis_authority::{serve, AuthorityConfig, AuthorityState};
use trellis_common::telemetry::{init_telemetry, TelemetryConfig};
use trellis_common::DEFAULT_AUTHORITY_ADDR;
use trellis_pki::CertificateAuthority;

/// Trellis authority - signs worker certificates and tracks registrations
#[derive(Parser, Debug)]
#[command(name = "trellis-authority", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "TRELLIS_AUTHORITY_LISTEN", default_value = DEFAULT_AUTHORITY_ADDR)]
    listen: SocketAddr,

    /// Issue a bootstrap token for a service and print it (repeatable)
    #[arg(long = "issue-token", value_name = "SERVICE")]
    issue_token: Vec<String>,

    /// Lifetime of issued worker certificates
    #[arg(long, default_value_t = 86_400)]
    cert_ttl_secs: u64,

    /// Service types accepted at registration (repeatable; default accepts any)
    #[arg(long = "service-type", value_name = "TYPE")]
    service_types: Vec<String>,

    /// Extra SANs for the authority's server certificate
    #[arg(long = "san", default_values = ["localhost", "127.0.0.1"])]
    sans: Vec<String>,

    /// Write the CA certificate to this path for workers to trust
    #[arg(long, value_name = "PATH")]
    write_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let _telemetry = init_telemetry(TelemetryConfig::for_service("trellis-authority"))?;

    let ca = CertificateAuthority::new("Trellis Root CA")
        .map_err(|e| anyhow::anyhow!("failed to create CA: {}", e))?;

    if let Some(path) = &cli.write_ca {
        std::fs::write(path, ca.ca_cert_pem())
            .map_err(|e| anyhow::anyhow!("failed to write CA to {}: {}", path.display(), e))?;
        info!(path = %path.display(), "Wrote CA certificate");
    }

    let config = AuthorityConfig {
        cert_ttl: Duration::from_secs(cli.cert_ttl_secs),
        supported_service_types: if cli.service_types.is_empty() {
            None
        } else {
            Some(cli.service_types.iter().cloned().collect::<BTreeSet<_>>())
        },
        ..Default::default()
    };
    let state = Arc::new(AuthorityState::new(ca, config));

    for service in &cli.issue_token {
        let token = state.issue_token(service)?;
        println!("{}={}", service, token);
    }

    let sans: Vec<&str> = cli.sans.iter().map(String::as_str).collect();
    let running = serve(state, cli.listen, &sans).await?;
    info!(addr = %running.local_addr(), "Trellis authority started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    running.shutdown().await;
    Ok(())
}
