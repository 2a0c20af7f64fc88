//! bvr - boot volume replacement for OKE self-managed nodes.
//!
//! Replaces the boot volume (image, size, cloud-init) of the OCI instances
//! backing the given Kubernetes nodes, draining cluster-managed nodes first
//! and waiting for them to rejoin afterwards.

mod cloudinit;
mod config;
mod error;
mod k8s;
mod oci;
mod upgrade;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::{debug, error, warn};

use config::{Args, Config};
use k8s::ClusterApi;
use k8s::node::KubeCluster;
use oci::ComputeApi;
use oci::cli::OciCli;
use upgrade::{NodeOutcome, UpgradeStatus, Upgrader, run_fleet};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = init_tracing(&config.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting bvr - boot volume replacement");

    match run(config).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Main application logic. Returns whether every node succeeded or was
/// skipped.
async fn run(config: Config) -> Result<bool> {
    if config.spec.interactive && config.parallelism > 1 {
        warn!(
            "--interactive with --parallelism {} will interleave confirmation prompts",
            config.parallelism
        );
    }

    let client = k8s::client::build_client(
        config.kubeconfig.as_deref(),
        config.context.as_deref(),
    )
    .await?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client));
    let compute: Arc<dyn ComputeApi> = Arc::new(OciCli::new(
        config.auth,
        config.region.clone(),
        config.oci_config_file.clone(),
        config.oci_profile.clone(),
    ));

    let upgrader = Arc::new(Upgrader::new(cluster, compute, config.spec));
    let outcomes = run_fleet(upgrader, &config.nodes, config.parallelism).await;

    print_summary(&outcomes);
    Ok(all_succeeded(&outcomes))
}

/// Whether no node failed or aborted.
fn all_succeeded(outcomes: &[NodeOutcome]) -> bool {
    !outcomes.iter().any(NodeOutcome::is_failure)
}

/// Print the per-node results and the IaC drift warning.
fn print_summary(outcomes: &[NodeOutcome]) {
    println!();
    for outcome in outcomes {
        let status = match outcome.status {
            UpgradeStatus::Succeeded => "SUCCEEDED".green(),
            UpgradeStatus::Failed => "FAILED".red(),
            UpgradeStatus::Skipped => "SKIPPED".yellow(),
            UpgradeStatus::Aborted => "ABORTED".red(),
        };
        match &outcome.detail {
            Some(detail) => println!("{}  {}: {}", status, outcome.node.bold(), detail),
            None => println!("{}  {}", status, outcome.node.bold()),
        }
    }

    if outcomes.iter().any(|o| o.cloud_init_changed) {
        println!(
            "\n{} Cloud-init was changed on at least one instance. If these nodes are \
             managed with Terraform or another IaC tool, update its configuration to \
             match, or the next apply will show drift.",
            "WARNING:".yellow()
        );
    }
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
