//! Container runtime interface.
//!
//! The runner never talks to the container engine directly; every lifecycle
//! step goes through [`ContainerRuntime`]. Two implementations exist:
//!
//! - [`DockerRuntime`]: Docker Engine API over its unix socket
//! - [`MockRuntime`]: in-memory runtime that records calls, for tests and dev runs

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

mod docker;
mod mock;

pub use docker::DockerRuntime;
pub use mock::{MockRuntime, RuntimeCall, RuntimeOp};

/// Label attached to every container this runner creates.
pub const MANAGED_LABEL: &str = "node-runner.managed";

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("timed out waiting for container {id} to {condition}")]
    Timeout { id: String, condition: &'static str },

    #[error("{0}")]
    Other(String),
}

/// Launch descriptor for a container.
///
/// The runner keeps the descriptor alongside the handle, so the container a
/// handle points at is always the one built from this descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Host path -> container path.
    pub volumes: BTreeMap<String, String>,
    /// Host port -> container port. An empty host port binds a random one.
    pub ports: Vec<(String, String)>,
    /// Files written under `/` in the container before it starts.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Whether the container may reach the host network via `host.docker.internal`.
    pub dial_host: bool,
    pub max_log_size: String,
    pub max_log_files: u32,
}

/// Handle to a container created by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub config: ContainerConfig,
}

/// Container lifecycle state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    /// Parse the state string used by the Docker API.
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List all containers known to the runtime.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Create and start a fresh container from `config`.
    ///
    /// Any container already holding `config.name` is removed first, so the
    /// returned handle always runs `config.image`.
    async fn start_container(
        &self,
        config: &ContainerConfig,
    ) -> Result<ManagedContainer, RuntimeError>;

    /// Start an existing, stopped container again, keeping its id and config.
    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Ask a container to stop. Does not wait.
    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Send a termination signal. Fails if the signal cannot be delivered.
    async fn terminate_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Wait until the container is no longer running.
    async fn wait_container_exit(&self, id: &str) -> Result<(), RuntimeError>;

    /// Wait until the container reports the running state.
    async fn wait_container_start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove stopped containers.
    async fn prune(&self) -> Result<(), RuntimeError>;

    /// Wait until the container is gone from the runtime.
    async fn wait_container_prune(&self, id: &str) -> Result<(), RuntimeError>;

    /// Make sure an image is available locally, pulling it when missing.
    async fn ensure_local_image(&self, name: &str, image_ref: &str) -> Result<(), RuntimeError>;

    /// Inspect a container by id.
    async fn get_container_by_id(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Remove every container this runner manages.
    ///
    /// Best-effort: an error means the runtime could not even be asked, while
    /// a container that refuses to die is only logged. Callers must not assume
    /// the environment is empty afterwards, only that an attempt was made.
    async fn nuke(&self) -> Result<(), RuntimeError>;
}
