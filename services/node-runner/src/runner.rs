//! The runner service.
//!
//! Keeps the updater and supervisor containers alive and on the latest
//! images:
//!
//! - **Start-up**: environment check, leftover cleanup, health endpoint,
//!   embedded launch
//! - **Update loop**: replaces containers as new image refs arrive
//!   (only with auto-update enabled)
//! - **Keep-alive loop**: restarts containers that exited, on a fixed interval

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::RunnerError;
use crate::health::{self, HealthCheck, HealthReport, RoleHealth};
use crate::images::{ChannelImageStore, ImageRefPublisher, ImageRefStream, ImageRefs, ImageStore};
use crate::launch::Role;
use crate::probes::EnvironmentProbe;
use crate::runtime::ContainerRuntime;
use crate::startup::run_startup_check;
use crate::state::{ContainerSet, ReplaceOutcome};

/// Called when the runner hits an error it cannot continue from.
pub type FatalHandler = Arc<dyn Fn(&RunnerError) + Send + Sync>;

/// Fatal handler that logs and terminates the process.
///
/// There is nothing above the runner to repair a half-replaced container,
/// so it exits and leaves the restart to the host's process supervisor.
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|err| {
        error!(error = %err, "Fatal runner error, terminating");
        std::process::exit(1);
    })
}

/// Runner service.
#[derive(Clone)]
pub struct Runner {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<dyn ImageStore>,
    probe: Arc<dyn EnvironmentProbe>,
    containers: Arc<ContainerSet>,
    shutdown: watch::Receiver<bool>,
    on_fatal: FatalHandler,
    update_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Runner {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        images: Arc<dyn ImageStore>,
        probe: Arc<dyn EnvironmentProbe>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let config = Arc::new(config);
        let containers = Arc::new(ContainerSet::new(config.clone(), runtime.clone()));
        Self {
            config,
            runtime,
            images,
            probe,
            containers,
            shutdown,
            on_fatal: exit_on_fatal(),
            update_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Runner fed by a [`ChannelImageStore`] seeded with the configured
    /// embedded images.
    ///
    /// The returned publisher is where a discovery source announces newer
    /// releases; the update loop ends once it is dropped.
    pub fn with_embedded_images(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn EnvironmentProbe>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, ImageRefPublisher) {
        let embedded = ImageRefs::new(config.images.supervisor.clone(), config.images.updater.clone());
        let (images, publisher) = ChannelImageStore::seeded(embedded);
        let runner = Self::new(config, runtime, Arc::new(images), probe, shutdown);
        (runner, publisher)
    }

    /// Replace the default fatal handler.
    pub fn with_fatal_handler(mut self, on_fatal: FatalHandler) -> Self {
        self.on_fatal = on_fatal;
        self
    }

    /// Name used when registering with a service supervisor.
    pub fn name(&self) -> &'static str {
        "runner"
    }

    /// The managed container set.
    pub fn containers(&self) -> &ContainerSet {
        &self.containers
    }

    /// Start the service.
    ///
    /// Fails if the environment check, the leftover cleanup or the embedded
    /// launch fails. The background loops keep running after this returns.
    pub async fn start(&self) -> Result<(), RunnerError> {
        run_startup_check(&self.config, self.runtime.as_ref(), self.probe.as_ref()).await?;

        self.runtime.nuke().await.map_err(RunnerError::Nuke)?;

        health::start_server(
            self.shutdown.clone(),
            self.config.health_addr,
            health::log_server_error,
            Arc::new(self.clone()),
        );

        if self.config.auto_update_enabled() {
            self.launch_embedded(Role::Updater).await?;
            let stream = self.images.latest()?;
            let runner = self.clone();
            let handle = tokio::spawn(async move { runner.run_update_loop(stream).await });
            *self.update_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        } else {
            info!("Auto-update disabled, running embedded supervisor only");
            self.launch_embedded(Role::Supervisor).await?;
        }

        let runner = self.clone();
        tokio::spawn(async move { runner.run_keep_alive_loop().await });

        Ok(())
    }

    /// Ask both containers to stop. Best-effort, does not wait.
    pub async fn stop(&self) {
        self.containers.stop_all().await;
    }

    /// Wait until the update loop exits, i.e. the image stream closed.
    ///
    /// Returns immediately when no update loop was started.
    pub async fn join_update_loop(&self) {
        let handle = self
            .update_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Update loop task panicked");
            }
        }
    }

    async fn launch_embedded(&self, role: Role) -> Result<(), RunnerError> {
        let refs = self.images.embedded_image_refs();
        info!(
            role = %role,
            supervisor = %refs.supervisor,
            updater = %refs.updater,
            "Launching embedded image"
        );
        self.containers
            .replace(role, &refs)
            .await
            .map(|_| ())
            .map_err(|source| RunnerError::EmbeddedLaunch { role, source })
    }

    /// Consume image ref updates until the stream closes.
    ///
    /// Each update is compared against what runs now, updater first. A
    /// recoverable failure leaves the role on its previous ref until the
    /// next update; a fatal one goes to the fatal handler and ends the loop.
    pub async fn run_update_loop(&self, mut updates: ImageRefStream) {
        info!("Watching for new images");

        while let Some(refs) = updates.next().await {
            info!(
                supervisor = %refs.supervisor,
                updater = %refs.updater,
                commit = refs.commit().unwrap_or_default(),
                "Detected new images"
            );

            let results = self
                .containers
                .apply(&refs, &[Role::Updater, Role::Supervisor])
                .await;

            for update in results {
                match update.result {
                    Ok(ReplaceOutcome::Replaced { image_ref, container_id }) => {
                        info!(role = %update.role, %image_ref, %container_id, "Replaced container");
                    }
                    Ok(ReplaceOutcome::Unchanged) if update.role == Role::Supervisor => {
                        info!("Skipping supervisor launch for now");
                    }
                    Ok(ReplaceOutcome::Unchanged) => {
                        debug!(role = %update.role, "Image unchanged");
                    }
                    Err(e) if e.is_fatal() => {
                        (self.on_fatal)(&RunnerError::Replace(e));
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Replace failed, waiting for the next update");
                    }
                }
            }
        }

        info!("Image stream closed, update loop exiting");
    }

    /// Restart exited containers every keep-alive interval until shutdown.
    pub async fn run_keep_alive_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.config.keep_alive_interval);
        // the first tick completes immediately
        interval.tick().await;

        info!(
            interval_secs = self.config.keep_alive_interval.as_secs(),
            "Starting keep-alive loop"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let restarts = self
                        .containers
                        .keep_alive(self.config.auto_update_enabled())
                        .await;
                    if restarts > 0 {
                        info!(restarts, "Keep-alive restarted containers");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Keep-alive loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl HealthCheck for Runner {
    async fn check_health(&self) -> HealthReport {
        let roles = self
            .containers
            .role_statuses()
            .await
            .into_iter()
            .map(|status| RoleHealth {
                role: status.role.to_string(),
                expected: status.role == Role::Supervisor || self.config.auto_update_enabled(),
                running: status.is_running(),
                image_ref: status.image_ref,
                container_id: status.container_id,
                state: status.state.map(|s| s.to_string()),
            })
            .collect();
        HealthReport::from_roles(roles)
    }
}
