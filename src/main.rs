//! liberator controller
//!
//! Main entry point. Sets up logging and the Kubernetes client, optionally
//! waits for the leader lease, and runs the PVC reconciliation loop.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use liberator::{
    config::Config,
    controllers::{self, Context},
    leader_election::LeaderElector,
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    init_tracing(&config);
    config.validate()?;

    info!("Starting liberator");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // Probes come up before leader election so standby replicas stay healthy
    metrics::init_readiness(config.leader_elect);
    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_bind_address));
    let probe_handle = tokio::spawn(metrics::serve(config.health_probe_bind_address));

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes API server");

    let leadership = if config.leader_elect {
        let elector = LeaderElector::new(client.clone(), config.lease_config());
        if !elector.acquire(&shutdown).await? {
            info!("Shutdown requested before acquiring leadership");
            return Ok(());
        }
        Some(tokio::spawn(elector.hold(shutdown.clone())))
    } else {
        None
    };

    let context = Arc::new(Context::new(client.clone(), &config, shutdown.clone()));
    let controller = controllers::run_claim_controller(client, context);

    let result = tokio::select! {
        _ = controller => {
            error!("PVC controller exited unexpectedly");
            Ok(())
        }
        result = leadership_lost(leadership) => result,
        result = metrics_handle => server_exited("metrics", result),
        result = probe_handle => server_exited("health probe", result),
        _ = shutdown.cancelled() => {
            info!("Received shutdown signal, stopping controller");
            Ok(())
        }
    };

    shutdown.cancel();
    info!("liberator stopped");
    result
}

/// Resolves only when a held lease is lost
fn leadership_lost(
    leadership: Option<tokio::task::JoinHandle<liberator::Result<()>>>,
) -> impl Future<Output = anyhow::Result<()>> {
    async move {
        let Some(handle) = leadership else {
            return std::future::pending().await;
        };
        match handle.await {
            Ok(Ok(())) => std::future::pending().await,
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(anyhow::anyhow!("leader election task failed: {}", e)),
        }
    }
}

/// Turn an HTTP server exit into the process result
fn server_exited(
    server: &str,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    let err = match result {
        Ok(Ok(())) => anyhow::anyhow!("{} server exited unexpectedly", server),
        Ok(Err(e)) => e.context(format!("{} server failed", server)),
        Err(e) => anyhow::anyhow!("{} server task failed: {}", server, e),
    };
    error!(error = %format!("{:#}", err), "HTTP server stopped");
    Err(err)
}

/// Initialize tracing subscriber
fn init_tracing(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
