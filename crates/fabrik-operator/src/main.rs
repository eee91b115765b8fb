//! Fabrik operator - watch-driven reconciliation for Fabrik resources

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fabrik_common::config::{FabrikConfig, OsEnvConfig};
use fabrik_common::kube_store::KubeResourceStore;
use fabrik_operator::StaleLockReaper;

/// Fabrik - reconciliation workers for service-fabrik resources
#[derive(Parser, Debug)]
#[command(name = "fabrik-operator", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "FABRIK_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace holding Fabrik resources (overrides the configuration file)
    #[arg(long, env = "FABRIK_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the stale-lock reaper
    ///
    /// Watches deployment lock records and unlocks those whose operation
    /// has finished or no longer exists.
    Reaper,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = FabrikConfig::load(cli.config.as_deref())?;
    if let Some(namespace) = cli.namespace {
        config.namespace = Some(namespace);
    }
    let identity = config.resolve_identity(&OsEnvConfig)?;

    match cli.command {
        Commands::Reaper => run_reaper(config, identity).await,
    }
}

async fn run_reaper(config: FabrikConfig, identity: String) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let store = Arc::new(KubeResourceStore::new(client, config.namespace()));

    info!(
        namespace = %config.namespace(),
        identity = %identity,
        "Starting stale-lock reaper"
    );
    let reaper = StaleLockReaper::new(store, &config, &identity);
    reaper.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    reaper.shutdown();
    Ok(())
}
