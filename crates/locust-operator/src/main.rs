//! Locust Operator - distributed Locust load tests on Kubernetes

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use locust_common::events::KubeEventPublisher;
use locust_common::telemetry::init_logging;
use locust_operator::config::{Cli, Commands, OperatorArgs};
use locust_operator::controller_runner::build_run_controller;
use locust_operator::health::serve_health;
use locust_operator::startup::{crd_yaml, ensure_crd_installed};
use locust_run::client::{KubeRunClient, RunKubeClient};
use locust_run::controller::RunContext;
use locust_run::stats::{build_fetcher, StatsDaemons};

const CONTROLLER_NAME: &str = "locust-operator";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = crd_yaml().map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_logging(&cli.operator.logging())?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.operator).await,
    }
}

async fn run_controller(args: OperatorArgs) -> anyhow::Result<()> {
    let stats_config = args.stats()?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let kube: Arc<dyn RunKubeClient> = Arc::new(KubeRunClient::new(client.clone()));
    let fetcher = build_fetcher(args.stats_access, client.clone())?;
    let interval = stats_config.interval;
    let stats = Arc::new(StatsDaemons::new(kube.clone(), fetcher, stats_config));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let ctx = Arc::new(RunContext::new(kube, events, stats.clone()));

    let health_port = args.health_port;
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_port).await {
            tracing::error!(error = %e, "health server failed");
        }
    });

    tracing::info!(
        stats_access = %args.stats_access,
        interval_secs = interval.as_secs(),
        "Starting Locust operator"
    );
    build_run_controller(client, args.namespace.as_deref(), ctx).await;

    tracing::info!("Controller stopped, shutting down stats daemons");
    stats.shutdown().await;
    Ok(())
}
