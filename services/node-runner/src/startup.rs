//! Start-up environment check.
//!
//! Preconditions are checked in order and the first failure wins:
//! 1. the container runtime answers
//! 2. the scan JSON-RPC endpoint answers
//! 3. the trace JSON-RPC endpoint answers (only when tracing is enabled)
//! 4. the alert batch API accepts a test batch

use tracing::{debug, info};

use crate::config::Config;
use crate::error::StartupCheckError;
use crate::probes::EnvironmentProbe;
use crate::runtime::ContainerRuntime;

/// Host alias containers use to reach the host. The check runs on the host
/// itself, where the alias does not resolve.
const CONTAINER_HOST_ALIAS: &str = "host.docker.internal";

/// Run all start-up checks.
pub async fn run_startup_check(
    config: &Config,
    runtime: &dyn ContainerRuntime,
    probe: &dyn EnvironmentProbe,
) -> Result<(), StartupCheckError> {
    let containers = runtime
        .list_containers()
        .await
        .map_err(StartupCheckError::Docker)?;
    debug!(containers = containers.len(), "Container runtime reachable");

    let block = probe
        .check_json_rpc(&fix_test_rpc_url(&config.scan.json_rpc_url))
        .await
        .map_err(StartupCheckError::ScanApi)?;
    debug!(block, "Scan JSON-RPC reachable");

    if config.trace.enabled {
        let block = probe
            .check_json_rpc(&fix_test_rpc_url(&config.trace.json_rpc_url))
            .await
            .map_err(StartupCheckError::TraceApi)?;
        debug!(block, "Trace JSON-RPC reachable");
    }

    probe
        .post_test_batch(&config.publish.api_url)
        .await
        .map_err(StartupCheckError::BatchApi)?;

    info!("Start-up check successful");
    Ok(())
}

/// Rewrite the container host alias to loopback.
pub fn fix_test_rpc_url(raw_url: &str) -> String {
    raw_url.replace(CONTAINER_HOST_ALIAS, "localhost")
}
