//! DBaaS Operator - provider-neutral database services for Kubernetes

use clap::{Parser, Subcommand};
use kube::Client;

use dbaas_common::telemetry::init_telemetry;
use dbaas_operator::config::ControllerConfig;
use dbaas_operator::controller_runner::{
    build_authz_controller, build_facade_controllers, build_policy_controller,
};
use dbaas_operator::crds::{ensure_crds_installed, render_crds};

/// DBaaS - facades over pluggable database providers
#[derive(Parser, Debug)]
#[command(name = "dbaas-operator", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ControllerConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every controller (default mode)
    ///
    /// - DBaaSInventory, DBaaSConnection and DBaaSInstance proxy controllers
    /// - DBaaSPolicy arbitration
    /// - Namespace authorization synthesis
    Controller,

    /// Print the CRD manifests as YAML and exit
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => {
            let yaml =
                render_crds().map_err(|e| anyhow::anyhow!("failed to serialize CRDs: {}", e))?;
            print!("{yaml}");
            Ok(())
        }
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    config.validate()?;
    init_telemetry(config.telemetry())?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    if config.install_crds {
        ensure_crds_installed(&client, &config.field_manager).await?;
    }

    tracing::info!(
        concurrency = config.concurrency,
        requeue_secs = config.requeue_secs,
        "starting controllers"
    );

    let mut controllers = build_facade_controllers(client.clone(), &config);
    controllers.push(build_policy_controller(client.clone(), &config));
    controllers.push(build_authz_controller(client, &config));

    futures::future::join_all(controllers).await;
    tracing::info!("controllers stopped");
    Ok(())
}
