//! kdmp-executor - data mover run inside KDMP worker jobs

use clap::Parser;

use kdmp_common::telemetry::{init_telemetry, TelemetryConfig};
use kdmp_executor::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::new("kdmp-executor"))?;

    if let Err(e) = kdmp_executor::run(cli).await {
        tracing::error!(error = %e, "executor failed");
        // a non-zero exit marks the job failed for the controller
        std::process::exit(1);
    }
    Ok(())
}
