//! In-memory container runtime.
//!
//! Records every call so tests can assert on the exact sequence of runtime
//! operations, and supports injecting failures per operation.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    ContainerConfig, ContainerInfo, ContainerRuntime, ContainerState, ManagedContainer,
    RuntimeError,
};

/// Runtime operation kinds, for call recording and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    ListContainers,
    StartContainer,
    RestartContainer,
    StopContainer,
    TerminateContainer,
    WaitContainerExit,
    WaitContainerStart,
    Prune,
    WaitContainerPrune,
    EnsureLocalImage,
    GetContainerById,
    Nuke,
}

/// A recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub op: RuntimeOp,
    /// Container id, container name or image ref, depending on the operation.
    pub target: String,
}

#[derive(Debug)]
struct MockContainer {
    info: ContainerInfo,
    config: ContainerConfig,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<RuntimeCall>,
    containers: BTreeMap<String, MockContainer>,
    failing: HashSet<RuntimeOp>,
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    /// Counter for generating container IDs.
    id_counter: AtomicU64,

    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            id_counter: AtomicU64::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make every future call of `op` fail.
    pub fn fail(&self, op: RuntimeOp) {
        self.lock().failing.insert(op);
    }

    /// Undo [`MockRuntime::fail`].
    pub fn recover(&self, op: RuntimeOp) {
        self.lock().failing.remove(&op);
    }

    /// Force the state of a container, e.g. to simulate a crash.
    pub fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.info.state = state;
        }
    }

    /// All calls recorded so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// Recorded calls of one kind, in order.
    pub fn calls_for(&self, op: RuntimeOp) -> Vec<RuntimeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    /// Number of recorded calls of one kind.
    pub fn count(&self, op: RuntimeOp) -> usize {
        self.lock().calls.iter().filter(|call| call.op == op).count()
    }

    /// Forget recorded calls. Containers are kept.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Launch descriptor the container with this name was created from.
    pub fn config_of(&self, name: &str) -> Option<ContainerConfig> {
        self.lock()
            .containers
            .values()
            .find(|c| c.info.name == name)
            .map(|c| c.config.clone())
    }

    /// Containers currently known to the mock.
    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.lock()
            .containers
            .values()
            .map(|c| c.info.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a call and report whether it was configured to fail.
    fn record(&self, op: RuntimeOp, target: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall {
            op,
            target: target.to_string(),
        });
        if state.failing.contains(&op) {
            return Err(RuntimeError::Other(format!(
                "mock runtime configured to fail {op:?}"
            )));
        }
        Ok(())
    }

    fn next_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("ctr_{:012x}", counter)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        self.record(RuntimeOp::ListContainers, "")?;
        Ok(self.containers())
    }

    async fn start_container(
        &self,
        config: &ContainerConfig,
    ) -> Result<ManagedContainer, RuntimeError> {
        self.record(RuntimeOp::StartContainer, &config.name)?;

        let mut state = self.lock();
        let stale: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| c.info.name == config.name)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            info!(container_id = %id, name = %config.name, "[MOCK] Removing container with the same name");
            state.containers.remove(&id);
        }

        let id = self.next_id();
        info!(container_id = %id, name = %config.name, image = %config.image, "[MOCK] Starting container");
        state.containers.insert(
            id.clone(),
            MockContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: config.name.clone(),
                    image: config.image.clone(),
                    state: ContainerState::Running,
                },
                config: config.clone(),
            },
        );

        Ok(ManagedContainer {
            id,
            name: config.name.clone(),
            config: config.clone(),
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::RestartContainer, id)?;
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(container) => {
                info!(container_id = %id, "[MOCK] Restarting container");
                container.info.state = ContainerState::Running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::StopContainer, id)?;
        debug!(container_id = %id, "[MOCK] Stopping container");
        self.set_state(id, ContainerState::Exited);
        Ok(())
    }

    async fn terminate_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::TerminateContainer, id)?;
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.info.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn wait_container_exit(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::WaitContainerExit, id)
    }

    async fn wait_container_start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::WaitContainerStart, id)
    }

    async fn prune(&self) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::Prune, "")?;
        self.lock()
            .containers
            .retain(|_, c| c.info.state != ContainerState::Exited);
        Ok(())
    }

    async fn wait_container_prune(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::WaitContainerPrune, id)
    }

    async fn ensure_local_image(&self, name: &str, image_ref: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::EnsureLocalImage, image_ref)?;
        debug!(name, image_ref, "[MOCK] Image ensured");
        Ok(())
    }

    async fn get_container_by_id(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.record(RuntimeOp::GetContainerById, id)?;
        self.lock()
            .containers
            .get(id)
            .map(|c| c.info.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn nuke(&self) -> Result<(), RuntimeError> {
        self.record(RuntimeOp::Nuke, "")?;
        self.lock().containers.clear();
        Ok(())
    }
}
