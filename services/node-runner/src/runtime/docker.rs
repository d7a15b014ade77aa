//! Docker runtime.
//!
//! Talks to the Docker daemon over its unix socket through `bollard`. Only
//! the handful of engine calls the runner needs are covered.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, PruneContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use tokio::time::{sleep, timeout, Instant};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{
    ContainerConfig, ContainerInfo, ContainerRuntime, ContainerState, ManagedContainer,
    RuntimeError, MANAGED_LABEL,
};

/// Signal sent by [`ContainerRuntime::terminate_container`].
const TERMINATE_SIGNAL: &str = "SIGTERM";

/// Seconds the engine waits after SIGTERM before killing on stop.
const STOP_GRACE_SECS: i64 = 10;

/// Timeout for a single engine request.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Docker runtime configuration.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Max time to wait for a lifecycle transition.
    pub wait_timeout: Duration,

    /// Delay between polls while waiting.
    pub poll_interval: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Docker runtime backed by the engine's unix socket.
pub struct DockerRuntime {
    socket_path: String,
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Connect to the engine at the given socket path.
    ///
    /// Connecting is lazy; an unreachable daemon shows up on the first call.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Result<Self, RuntimeError> {
        Self::with_config(socket_path, DockerConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(
        socket_path: P,
        config: DockerConfig,
    ) -> Result<Self, RuntimeError> {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let docker = Docker::connect_with_unix(&socket_path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?;
        Ok(Self {
            socket_path,
            docker,
            config,
        })
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn list(&self, filters: HashMap<String, Vec<String>>) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries
            .into_iter()
            .map(|s| ContainerInfo {
                name: s
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                id: s.id.unwrap_or_default(),
                image: s.image.unwrap_or_default(),
                state: ContainerState::parse(s.state.as_deref().unwrap_or_default()),
            })
            .collect())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_of(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_files(
        &self,
        id: &str,
        files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), RuntimeError> {
        if files.is_empty() {
            return Ok(());
        }
        let archive = build_archive(files)?;
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await?;
        Ok(())
    }

    async fn image_exists(&self, image_ref: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image_ref).await {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until `done` holds for the container, or time out.
    async fn wait_until<F>(
        &self,
        id: &str,
        condition: &'static str,
        mut done: F,
    ) -> Result<(), RuntimeError>
    where
        F: FnMut(Result<ContainerInfo, RuntimeError>) -> Result<bool, RuntimeError>,
    {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            if done(self.get_container_by_id(id).await)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::Timeout {
                    id: id.to_string(),
                    condition,
                });
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        self.list(HashMap::new()).await
    }

    async fn start_container(
        &self,
        config: &ContainerConfig,
    ) -> Result<ManagedContainer, RuntimeError> {
        let filters = HashMap::from([("name".to_string(), vec![config.name.clone()])]);
        for existing in self.list(filters).await? {
            // the name filter matches substrings
            if existing.name != config.name {
                continue;
            }
            info!(
                container_id = %existing.id,
                name = %config.name,
                image = %existing.image,
                "Removing container with the same name"
            );
            self.remove_container(&existing.id).await?;
        }

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), create_config(config))
            .await?;
        let id = response.id;

        self.upload_files(&id, &config.files).await?;
        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;
        info!(container_id = %id, name = %config.name, image = %config.image, "Container started");

        Ok(ManagedContainer {
            id,
            name: config.name.clone(),
            config: config.clone(),
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // already started
            Err(e) if status_of(&e) == Some(304) => Ok(()),
            Err(e) if status_of(&e) == Some(404) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_of(&e) == Some(304) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn terminate_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = KillContainerOptions {
            signal: TERMINATE_SIGNAL,
        };
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_of(&e) == Some(404) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_container_exit(&self, id: &str) -> Result<(), RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.docker.wait_container(id, Some(options)));

        let result = timeout(self.config.wait_timeout, stream.next())
            .await
            .map_err(|_| RuntimeError::Timeout {
                id: id.to_string(),
                condition: "exit",
            })?;

        match result {
            None | Some(Ok(_)) => Ok(()),
            // a non-zero exit code is still an exit
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                debug!(container_id = %id, code, "Container exited with non-zero code");
                Ok(())
            }
            Some(Err(e)) if status_of(&e) == Some(404) => Ok(()),
            Some(Err(e)) => Err(e.into()),
        }
    }

    async fn wait_container_start(&self, id: &str) -> Result<(), RuntimeError> {
        self.wait_until(id, "start", |result| {
            result.map(|info| info.state == ContainerState::Running)
        })
        .await
    }

    async fn prune(&self) -> Result<(), RuntimeError> {
        let options = PruneContainersOptions {
            filters: managed_filter(),
        };
        let response = self.docker.prune_containers(Some(options)).await?;
        debug!(
            removed = response.containers_deleted.map(|c| c.len()).unwrap_or(0),
            "Pruned stopped containers"
        );
        Ok(())
    }

    async fn wait_container_prune(&self, id: &str) -> Result<(), RuntimeError> {
        self.wait_until(id, "be pruned", |result| match result {
            Ok(_) => Ok(false),
            Err(RuntimeError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        })
        .await
    }

    async fn ensure_local_image(&self, name: &str, image_ref: &str) -> Result<(), RuntimeError> {
        if self.image_exists(image_ref).await? {
            debug!(name, image_ref, "Image already present");
            return Ok(());
        }

        info!(name, image_ref, "Pulling image");
        let options = CreateImageOptions {
            from_image: image_ref.to_string(),
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.create_image(Some(options), None, None));
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(message) = progress.error {
                return Err(RuntimeError::Other(format!("pull of {image_ref} failed: {message}")));
            }
            if let Some(status) = progress.status {
                debug!(name, status = %status, "Pull progress");
            }
        }

        if !self.image_exists(image_ref).await? {
            return Err(RuntimeError::NotFound(image_ref.to_string()));
        }
        Ok(())
    }

    async fn get_container_by_id(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let inspect = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if status_of(&e) == Some(404) => {
                return Err(RuntimeError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: inspect.config.and_then(|c| c.image).unwrap_or_default(),
            state: inspect
                .state
                .and_then(|s| s.status)
                .map(|status| ContainerState::parse(&status.to_string()))
                .unwrap_or(ContainerState::Unknown),
        })
    }

    async fn nuke(&self) -> Result<(), RuntimeError> {
        let managed = self.list(managed_filter()).await?;

        info!(count = managed.len(), "Removing leftover managed containers");
        for container in managed {
            if let Err(e) = self.remove_container(&container.id).await {
                warn!(container_id = %container.id, error = %e, "Failed to remove leftover container");
            }
        }
        Ok(())
    }
}

/// HTTP status of an engine error response, if it was one.
fn status_of(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn managed_filter() -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![MANAGED_LABEL.to_string()])])
}

/// Engine create request for a launch descriptor.
fn create_config(config: &ContainerConfig) -> Config<String> {
    let env: Vec<String> = config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let binds: Vec<String> = config
        .volumes
        .iter()
        .map(|(host, container)| format!("{host}:{container}"))
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (host_port, container_port) in &config.ports {
        let key = format!("{container_port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings
            .entry(key)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: None,
                host_port: Some(host_port.clone()),
            });
    }

    let host_config = HostConfig {
        binds: Some(binds),
        port_bindings: Some(port_bindings),
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(HashMap::from([
                ("max-size".to_string(), config.max_log_size.clone()),
                ("max-file".to_string(), config.max_log_files.to_string()),
            ])),
        }),
        extra_hosts: config
            .dial_host
            .then(|| vec!["host.docker.internal:host-gateway".to_string()]),
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        cmd: Some(config.cmd.clone()),
        env: Some(env),
        labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Pack files into a tar archive rooted at `/`.
fn build_archive(files: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, RuntimeError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_config_maps_ports_and_volumes() {
        let config = ContainerConfig {
            name: "node-runner-supervisor".to_string(),
            image: "img:v1".to_string(),
            cmd: vec!["/node-runner".to_string(), "supervisor".to_string()],
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            volumes: BTreeMap::from([("/host".to_string(), "/.node".to_string())]),
            ports: vec![
                ("".to_string(), "8090".to_string()),
                ("8770".to_string(), "8770".to_string()),
            ],
            dial_host: true,
            max_log_size: "50m".to_string(),
            max_log_files: 10,
            ..Default::default()
        };

        let created = create_config(&config);
        assert_eq!(created.env, Some(vec!["A=1".to_string()]));
        assert_eq!(created.labels.unwrap()[MANAGED_LABEL], "true");
        assert!(created.exposed_ports.unwrap().contains_key("8090/tcp"));

        let host = created.host_config.unwrap();
        assert_eq!(host.binds, Some(vec!["/host:/.node".to_string()]));
        let bindings = host.port_bindings.unwrap();
        let bound = |key: &str| {
            bindings[key].as_ref().unwrap()[0]
                .host_port
                .clone()
                .unwrap()
        };
        assert_eq!(bound("8090/tcp"), "");
        assert_eq!(bound("8770/tcp"), "8770");
        assert_eq!(host.log_config.unwrap().config.unwrap()["max-file"], "10");
        assert_eq!(
            host.extra_hosts,
            Some(vec!["host.docker.internal:host-gateway".to_string()])
        );
    }

    #[test]
    fn test_create_config_without_host_access() {
        let created = create_config(&ContainerConfig {
            name: "node-runner-updater".to_string(),
            image: "img:v1".to_string(),
            ..Default::default()
        });
        assert_eq!(created.host_config.unwrap().extra_hosts, None);
    }

    #[test]
    fn test_build_archive_contains_files() {
        let files = BTreeMap::from([("passphrase".to_string(), b"secret".to_vec())]);
        let archive = build_archive(&files).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["passphrase".to_string()]);
    }

    #[test]
    fn test_status_of_engine_errors() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert_eq!(status_of(&not_found), Some(404));
        assert_eq!(status_of(&DockerError::RequestTimeoutError), None);
    }
}
