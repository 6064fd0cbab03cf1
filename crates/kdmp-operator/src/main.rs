//! KDMP Operator - moves Kubernetes volume data between claims and backup repositories

mod controller_runner;
mod crds;

use clap::{Parser, Subcommand};
use kube::Client;

use kdmp_common::config::CONFIG_MAP_NAME;
use kdmp_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use kdmp_common::telemetry::{init_telemetry, TelemetryConfig};
use kdmp_common::DEFAULT_OPERATOR_NAMESPACE;

/// kdmp-operator - reconciles DataExport resources
#[derive(Parser, Debug)]
#[command(name = "kdmp-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[derive(clap::Args, Debug, Default)]
struct ControllerArgs {
    /// Namespace holding the configuration ConfigMap and the leader lease
    #[arg(long, global = true, env = "POD_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    namespace: String,

    /// Name of the configuration ConfigMap
    #[arg(long, global = true, env = "KDMP_CONFIG_MAP", default_value = CONFIG_MAP_NAME)]
    config_map: String,

    /// Name of the leader election Lease
    #[arg(long, global = true, default_value = LEADER_LEASE_NAME)]
    lease_name: String,

    /// Identity recorded on the lease; defaults to the pod name
    #[arg(long, global = true, env = "POD_NAME")]
    identity: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot reach the API server without a TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds::render_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::new("kdmp-operator"))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

impl ControllerArgs {
    fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("kdmp-operator-{}", std::process::id()))
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    crds::ensure_crds_installed(&client).await?;

    let identity = args.identity();
    tracing::info!(identity = %identity, lease = %args.lease_name, "Waiting for leadership");
    let mut guard = LeaderElector::new(client.clone(), &args.lease_name, &args.namespace, &identity)
        .acquire()
        .await;
    tracing::info!(identity = %identity, "Acquired leadership, starting controllers");

    tokio::select! {
        _ = controller_runner::run_export_controller(client, &args.namespace, &args.config_map) => {
            tracing::info!("DataExport controller completed");
        }
        _ = guard.lost() => {
            // another replica may already be reconciling; stop before acting twice
            tracing::error!("Leadership lost, exiting");
            std::process::exit(1);
        }
    }

    tracing::info!("KDMP operator shutting down");
    Ok(())
}
