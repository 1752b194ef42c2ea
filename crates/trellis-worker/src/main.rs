//! Trellis worker - joins the mesh and serves its capability set

use clap::{Parser, Subcommand};
use tracing::{error, info};

use trellis_common::config::{OsEnv, WorkerConfig};
use trellis_common::telemetry::{init_telemetry, TelemetryConfig};
use trellis_worker::{ServiceRegistry, Worker};

/// Trellis worker
#[derive(Parser, Debug)]
#[command(name = "trellis-worker", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the worker (default); configured from TRELLIS_* environment variables
    Run,
    /// Print the capability descriptors of a service type as JSON
    Capabilities {
        /// Service type to describe
        #[arg(long)]
        service_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Capabilities { service_type } => print_capabilities(&service_type),
    }
}

fn print_capabilities(service_type: &str) -> anyhow::Result<()> {
    let registry = ServiceRegistry::builtin();
    let set = registry.get(service_type).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown service type '{}' (known: {})",
            service_type,
            registry.service_types().join(", ")
        )
    })?;
    println!("{}", serde_json::to_string_pretty(&set.descriptors())?);
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env(&OsEnv)?;
    let _telemetry = init_telemetry(TelemetryConfig::for_service(config.service_name.clone()))?;
    info!(config = ?config, "Starting Trellis worker");

    let running = match Worker::new(config).start().await {
        Ok(running) => running,
        Err(e) => {
            match e.acquisition_step() {
                Some(step) => error!(step = %step, error = %e, "Certificate acquisition failed"),
                None => error!(error = %e, "Worker startup failed"),
            }
            return Err(e.into());
        }
    };

    let reason = running.wait().await;
    info!(reason = ?reason, "Trellis worker exited");
    Ok(())
}
