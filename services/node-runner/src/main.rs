//! Node Runner
//!
//! Long-lived host process of a scanning node. Checks the environment,
//! launches the embedded images and then keeps the updater and supervisor
//! containers alive and on the latest release.
//!
//! ## Architecture
//!
//! - **Start-up check**: container runtime, JSON-RPC endpoints, batch API
//! - **Update loop**: replaces containers as new image refs are discovered
//! - **Keep-alive loop**: restarts containers that exited
//! - **Runtime**: Docker Engine API over the unix socket (mock for local runs)

use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use node_runner::config::Config;
use node_runner::probes::HttpProbe;
use node_runner::runner::Runner;
use node_runner::runtime::{ContainerRuntime, DockerRuntime, MockRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log.level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        development = config.development,
        auto_update = config.auto_update_enabled(),
        node_dir = %config.node_dir,
        health_addr = %config.health_addr,
        "Starting node runner"
    );

    let runtime: Arc<dyn ContainerRuntime> = if std::env::var_os("RUNNER_MOCK_RUNTIME").is_some() {
        info!("Using mock container runtime");
        Arc::new(MockRuntime::new())
    } else {
        let docker = DockerRuntime::new(&config.docker_socket)?;
        if !docker.socket_exists() {
            warn!(socket = %config.docker_socket, "Docker socket not found");
        }
        Arc::new(docker)
    };

    let probe = HttpProbe::new()?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The stream opens with the embedded pair; the publisher is held so it stays open.
    let (runner, _publisher) =
        Runner::with_embedded_images(config, runtime, Arc::new(probe), shutdown_rx);
    info!(service = runner.name(), "Starting service");
    runner.start().await?;

    // Wait for shutdown signal
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    runner.stop().await;

    info!("Node runner shutdown complete");
    Ok(())
}
