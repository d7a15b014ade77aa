//! Managed container set.
//!
//! [`ContainerSet`] is the only owner of the updater and supervisor handles
//! and of the image refs they run. Everything goes through transactional
//! operations that hold one lock for their whole duration, runtime calls
//! included, so at most one runtime operation sequence is in flight.
//!
//! ## Replace protocol
//!
//! ```text
//! Running(old) -> Stopping -> Stopped -> Pruning -> ImageEnsured -> Starting -> Running(new)
//! ```
//!
//! The recorded image ref only advances once the new container is confirmed
//! running. A failed replace keeps the previous ref so that the next update
//! carrying the same target triggers another attempt.

use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ReplaceError, ReplaceStep};
use crate::images::ImageRefs;
use crate::launch::{launch_config, Role};
use crate::registry::validate_registry_image_ref;
use crate::runtime::{ContainerRuntime, ContainerState, ManagedContainer, RuntimeError};

/// Where a role is in its lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReplacePhase {
    /// Nothing launched yet.
    #[default]
    Idle,
    Running(String),
    Stopping,
    Stopped,
    Pruning,
    ImageEnsured,
    Starting,
    /// The last replace failed at this step.
    Failed(ReplaceStep),
}

/// State of one role.
#[derive(Debug, Clone, Default)]
pub struct RoleSlot {
    /// Image ref the container was started from, as requested.
    pub image_ref: Option<String>,
    pub container: Option<ManagedContainer>,
    pub phase: ReplacePhase,
}

/// State of both roles.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorState {
    pub updater: RoleSlot,
    pub supervisor: RoleSlot,
}

impl OrchestratorState {
    pub fn slot(&self, role: Role) -> &RoleSlot {
        match role {
            Role::Updater => &self.updater,
            Role::Supervisor => &self.supervisor,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut RoleSlot {
        match role {
            Role::Updater => &mut self.updater,
            Role::Supervisor => &mut self.supervisor,
        }
    }
}

/// Result of a successful replace call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced {
        image_ref: String,
        container_id: String,
    },
    /// The role already runs the requested ref.
    Unchanged,
}

/// Outcome for one role of an [`ContainerSet::apply`] call.
#[derive(Debug)]
pub struct RoleUpdate {
    pub role: Role,
    pub result: Result<ReplaceOutcome, ReplaceError>,
}

/// Live status of one role, for health reporting.
#[derive(Debug, Clone)]
pub struct RoleStatus {
    pub role: Role,
    pub image_ref: Option<String>,
    pub container_id: Option<String>,
    pub phase: ReplacePhase,
    /// State reported by the runtime, if it could be queried.
    pub state: Option<ContainerState>,
}

impl RoleStatus {
    pub fn is_running(&self) -> bool {
        self.state == Some(ContainerState::Running)
    }
}

/// Owner of the managed containers.
pub struct ContainerSet {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    state: RwLock<OrchestratorState>,
    /// Copy of `state` updated on every phase change, readable while a
    /// replace holds the lock.
    last_known: watch::Sender<OrchestratorState>,
}

impl ContainerSet {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            state: RwLock::new(OrchestratorState::default()),
            last_known: watch::channel(OrchestratorState::default()).0,
        }
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> OrchestratorState {
        self.state.read().await.clone()
    }

    /// Replace `role` with the ref from `refs`, whatever it runs now.
    pub async fn replace(&self, role: Role, refs: &ImageRefs) -> Result<ReplaceOutcome, ReplaceError> {
        let mut state = self.state.write().await;
        self.replace_locked(&mut state, role, refs).await
    }

    /// Replace `role` only if it does not already run the ref from `refs`.
    pub async fn replace_if_changed(
        &self,
        role: Role,
        refs: &ImageRefs,
    ) -> Result<ReplaceOutcome, ReplaceError> {
        let mut state = self.state.write().await;
        self.compare_and_replace(&mut state, role, refs).await
    }

    /// Compare-and-replace several roles in order under a single lock.
    ///
    /// Roles are independent: a recoverable failure of one does not skip
    /// the next. A fatal failure stops processing, since nothing should
    /// touch the runtime while a role is in an unknown state.
    pub async fn apply(&self, refs: &ImageRefs, roles: &[Role]) -> Vec<RoleUpdate> {
        let mut state = self.state.write().await;
        let mut updates = Vec::with_capacity(roles.len());

        for &role in roles {
            let result = self.compare_and_replace(&mut state, role, refs).await;
            let fatal = matches!(&result, Err(e) if e.is_fatal());
            updates.push(RoleUpdate { role, result });
            if fatal {
                break;
            }
        }

        updates
    }

    /// Restart managed containers that exited. Returns the number of restarts issued.
    ///
    /// Failures are logged and left for the next pass.
    pub async fn keep_alive(&self, include_updater: bool) -> usize {
        let state = self.state.write().await;
        let mut restarts = 0;

        for role in [Role::Supervisor, Role::Updater] {
            if role == Role::Updater && !include_updater {
                continue;
            }
            let Some(container) = &state.slot(role).container else {
                continue;
            };

            match self.runtime.get_container_by_id(&container.id).await {
                Ok(info) if info.state == ContainerState::Exited => {
                    info!(role = %role, container_id = %container.id, "Container exited, restarting");
                    restarts += 1;
                    if let Err(e) = self.runtime.restart_container(&container.id).await {
                        warn!(role = %role, container_id = %container.id, error = %e, "Failed to restart container");
                    }
                }
                Ok(info) => {
                    debug!(role = %role, container_id = %container.id, state = %info.state, "Container alive");
                }
                Err(e) => {
                    warn!(role = %role, container_id = %container.id, error = %e, "Failed to query container");
                }
            }
        }

        restarts
    }

    /// Ask both containers to stop. Does not wait and keeps the handles.
    pub async fn stop_all(&self) {
        let state = self.state.read().await;

        for role in [Role::Updater, Role::Supervisor] {
            if let Some(container) = &state.slot(role).container {
                info!(role = %role, container_id = %container.id, "Stopping container");
                if let Err(e) = self.runtime.stop_container(&container.id).await {
                    warn!(role = %role, container_id = %container.id, error = %e, "Failed to stop container");
                }
            }
        }
    }

    /// Query the runtime for the state of each role.
    ///
    /// While a replace is in flight the runtime is not queried; the last
    /// known phase is reported with no runtime state.
    pub async fn role_statuses(&self) -> Vec<RoleStatus> {
        let Ok(state) = self.state.try_read() else {
            let last_known = self.last_known.borrow();
            return [Role::Updater, Role::Supervisor]
                .into_iter()
                .map(|role| {
                    let slot = last_known.slot(role);
                    RoleStatus {
                        role,
                        image_ref: slot.image_ref.clone(),
                        container_id: slot.container.as_ref().map(|c| c.id.clone()),
                        phase: slot.phase.clone(),
                        state: None,
                    }
                })
                .collect();
        };
        let mut statuses = Vec::with_capacity(2);

        for role in [Role::Updater, Role::Supervisor] {
            let slot = state.slot(role);
            let runtime_state = match &slot.container {
                Some(container) => match self.runtime.get_container_by_id(&container.id).await {
                    Ok(info) => Some(info.state),
                    Err(e) => {
                        debug!(role = %role, error = %e, "Health query failed");
                        None
                    }
                },
                None => None,
            };
            statuses.push(RoleStatus {
                role,
                image_ref: slot.image_ref.clone(),
                container_id: slot.container.as_ref().map(|c| c.id.clone()),
                phase: slot.phase.clone(),
                state: runtime_state,
            });
        }

        statuses
    }

    async fn compare_and_replace(
        &self,
        state: &mut OrchestratorState,
        role: Role,
        refs: &ImageRefs,
    ) -> Result<ReplaceOutcome, ReplaceError> {
        let desired = role.image_ref(refs);
        if state.slot(role).image_ref.as_deref() == Some(desired) {
            debug!(role = %role, image_ref = desired, "Already running desired image");
            return Ok(ReplaceOutcome::Unchanged);
        }
        self.replace_locked(state, role, refs).await
    }

    async fn replace_locked(
        &self,
        state: &mut OrchestratorState,
        role: Role,
        refs: &ImageRefs,
    ) -> Result<ReplaceOutcome, ReplaceError> {
        let requested = role.image_ref(refs).to_string();
        let slot = state.slot_mut(role);

        info!(
            role = %role,
            image_ref = %requested,
            current = slot.image_ref.as_deref().unwrap_or("none"),
            "Replacing container"
        );

        let result = self.run_replace(slot, role, &requested, refs).await;
        if let Err(e) = &result {
            slot.phase = ReplacePhase::Failed(e.step);
        }
        self.publish(role, slot);
        result
    }

    /// Move `slot` to `phase` and make it visible to health queries.
    fn set_phase(&self, role: Role, slot: &mut RoleSlot, phase: ReplacePhase) {
        debug!(role = %role, phase = ?phase, "Replace phase");
        slot.phase = phase;
        self.publish(role, slot);
    }

    fn publish(&self, role: Role, slot: &RoleSlot) {
        self.last_known
            .send_modify(|state| *state.slot_mut(role) = slot.clone());
    }

    async fn run_replace(
        &self,
        slot: &mut RoleSlot,
        role: Role,
        requested: &str,
        refs: &ImageRefs,
    ) -> Result<ReplaceOutcome, ReplaceError> {
        let error = |step: ReplaceStep, container_id: Option<&str>, source: RuntimeError| {
            ReplaceError {
                role,
                step,
                image_ref: requested.to_string(),
                container_id: container_id.map(str::to_string),
                source,
            }
        };

        if let Some(old) = slot.container.clone() {
            self.set_phase(role, slot, ReplacePhase::Stopping);
            match self.runtime.terminate_container(&old.id).await {
                Ok(()) => info!(role = %role, container_id = %old.id, name = %old.name, "Interrupted"),
                Err(e) => warn!(
                    role = %role,
                    container_id = %old.id,
                    name = %old.name,
                    step = %ReplaceStep::Terminate,
                    error = %e,
                    "Error stopping container"
                ),
            }
            self.runtime
                .wait_container_exit(&old.id)
                .await
                .map_err(|e| error(ReplaceStep::ConfirmExit, Some(old.id.as_str()), e))?;

            // The old container is gone from here on, whatever happens next.
            slot.container = None;
            self.set_phase(role, slot, ReplacePhase::Stopped);

            self.set_phase(role, slot, ReplacePhase::Pruning);
            self.runtime
                .prune()
                .await
                .map_err(|e| error(ReplaceStep::Prune, Some(old.id.as_str()), e))?;
            self.runtime
                .wait_container_prune(&old.id)
                .await
                .map_err(|e| error(ReplaceStep::ConfirmPrune, Some(old.id.as_str()), e))?;
        }

        let image_ref = self
            .ensure_image(role, requested)
            .await
            .map_err(|e| error(ReplaceStep::EnsureImage, None, e))?;
        self.set_phase(role, slot, ReplacePhase::ImageEnsured);

        let launch = launch_config(role, &self.config, &image_ref, refs);
        self.set_phase(role, slot, ReplacePhase::Starting);
        let container = self
            .runtime
            .start_container(&launch)
            .await
            .map_err(|e| error(ReplaceStep::StartCommand, None, e))?;

        // tracked before the start is confirmed
        let container_id = container.id.clone();
        slot.container = Some(container);

        self.runtime
            .wait_container_start(&container_id)
            .await
            .map_err(|e| error(ReplaceStep::ConfirmStart, Some(container_id.as_str()), e))?;

        info!(role = %role, container_id = %container_id, image_ref = %image_ref, "Container running");

        slot.image_ref = Some(requested.to_string());
        slot.phase = ReplacePhase::Running(requested.to_string());

        Ok(ReplaceOutcome::Replaced {
            image_ref: requested.to_string(),
            container_id,
        })
    }

    /// Resolve the ref to pull and make sure the image is present locally.
    async fn ensure_image(&self, role: Role, requested: &str) -> Result<String, RuntimeError> {
        let mut image_ref = requested.to_string();

        // development images are usually local builds, not registry releases
        if !self.config.development {
            match validate_registry_image_ref(&self.config.registry.container_registry, requested) {
                Ok(fixed) => image_ref = fixed,
                Err(e) => warn!(
                    role = %role,
                    image_ref = requested,
                    error = %e,
                    "Not a registry release ref, using it as is"
                ),
            }
        }

        if let Err(e) = self.runtime.ensure_local_image(role.as_str(), &image_ref).await {
            warn!(role = %role, image_ref = %image_ref, error = %e, "Failed to ensure local image");
            return Err(e);
        }

        Ok(image_ref)
    }
}
