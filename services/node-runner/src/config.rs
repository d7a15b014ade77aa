//! Configuration for the node runner.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Supervisor image launched when no release has been discovered yet.
pub const DEFAULT_SUPERVISOR_IMAGE: &str = "node-runner/supervisor:latest";

/// Updater image launched when no release has been discovered yet.
pub const DEFAULT_UPDATER_IMAGE: &str = "node-runner/updater:latest";

/// Node runner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Development mode: skips registry ref validation and is passed to the updater.
    pub development: bool,

    /// Host directory holding node configuration, mounted into both containers.
    pub node_dir: String,

    /// Passphrase injected into the supervisor for key decryption.
    pub passphrase: String,

    pub auto_update: AutoUpdateConfig,
    pub scan: JsonRpcConfig,
    pub trace: TraceConfig,
    pub publish: PublishConfig,
    pub registry: RegistryConfig,
    pub log: LogConfig,
    pub images: EmbeddedImages,

    /// Bind address for the health endpoint.
    pub health_addr: SocketAddr,

    /// Path of the Docker Engine unix socket.
    pub docker_socket: String,

    /// Interval between keep-alive passes.
    pub keep_alive_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct AutoUpdateConfig {
    pub disable: bool,
}

#[derive(Debug, Clone)]
pub struct JsonRpcConfig {
    pub json_rpc_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub json_rpc_url: String,
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Base URL of the alert batch API.
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry host that release image refs are rewritten against.
    pub container_registry: String,
}

/// Log settings for the runner itself and the containers it launches.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Max size of a container log file before rotation, e.g. `50m`.
    pub max_log_size: String,

    /// Number of rotated container log files kept.
    pub max_log_files: u32,
}

/// Image refs built into this runner release.
#[derive(Debug, Clone)]
pub struct EmbeddedImages {
    pub supervisor: String,
    pub updater: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str| {
            lookup(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        let max_log_files = var("RUNNER_MAX_LOG_FILES", "10")
            .parse()
            .context("RUNNER_MAX_LOG_FILES must be a non-negative integer")?;

        let health_addr = var("RUNNER_HEALTH_ADDR", "0.0.0.0:8090")
            .parse()
            .context("RUNNER_HEALTH_ADDR must be a socket address")?;

        let keep_alive_secs: u64 = var("RUNNER_KEEP_ALIVE_INTERVAL", "10")
            .parse()
            .context("RUNNER_KEEP_ALIVE_INTERVAL must be a number of seconds")?;
        if keep_alive_secs == 0 {
            anyhow::bail!("RUNNER_KEEP_ALIVE_INTERVAL must be greater than zero");
        }

        Ok(Self {
            development: flag("RUNNER_DEVELOPMENT"),
            node_dir: var("RUNNER_NODE_DIR", "/var/lib/node-runner"),
            passphrase: var("RUNNER_PASSPHRASE", ""),
            auto_update: AutoUpdateConfig {
                disable: flag("RUNNER_AUTO_UPDATE_DISABLE"),
            },
            scan: JsonRpcConfig {
                json_rpc_url: var("RUNNER_SCAN_JSON_RPC_URL", "http://localhost:8545"),
            },
            trace: TraceConfig {
                enabled: flag("RUNNER_TRACE_ENABLED"),
                json_rpc_url: var("RUNNER_TRACE_JSON_RPC_URL", ""),
            },
            publish: PublishConfig {
                api_url: var("RUNNER_PUBLISH_API_URL", "http://localhost:8080"),
            },
            registry: RegistryConfig {
                container_registry: var("RUNNER_CONTAINER_REGISTRY", "localhost:1970"),
            },
            log: LogConfig {
                level: var("RUNNER_LOG_LEVEL", "info"),
                max_log_size: var("RUNNER_MAX_LOG_SIZE", "50m"),
                max_log_files,
            },
            images: EmbeddedImages {
                supervisor: var("RUNNER_SUPERVISOR_IMAGE", DEFAULT_SUPERVISOR_IMAGE),
                updater: var("RUNNER_UPDATER_IMAGE", DEFAULT_UPDATER_IMAGE),
            },
            health_addr,
            docker_socket: var("RUNNER_DOCKER_SOCKET", "/var/run/docker.sock"),
            keep_alive_interval: Duration::from_secs(keep_alive_secs),
        })
    }

    /// Whether the updater should be launched and kept up to date.
    pub fn auto_update_enabled(&self) -> bool {
        !self.auto_update.disable
    }
}
