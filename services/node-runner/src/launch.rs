//! Launch descriptors for the two managed containers.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::Config;
use crate::images::ImageRefs;
use crate::runtime::ContainerConfig;

pub const UPDATER_CONTAINER_NAME: &str = "node-runner-updater";
pub const SUPERVISOR_CONTAINER_NAME: &str = "node-runner-supervisor";

/// Node binary inside the release images.
pub const NODE_BINARY_PATH: &str = "/node-runner";

/// Where the host node directory is mounted inside containers.
pub const CONTAINER_NODE_DIR: &str = "/.node";

pub const CONTAINER_PORT: &str = "8770";
pub const HEALTH_PORT: &str = "8090";

pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";
pub const PASSPHRASE_FILE: &str = "passphrase";

pub const ENV_DEVELOPMENT: &str = "RUNNER_DEVELOPMENT";
pub const ENV_RELEASE_INFO: &str = "RUNNER_RELEASE_INFO";
pub const ENV_HOST_NODE_DIR: &str = "RUNNER_HOST_NODE_DIR";

/// A managed container role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Updater,
    Supervisor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Updater => "updater",
            Role::Supervisor => "supervisor",
        }
    }

    pub fn container_name(&self) -> &'static str {
        match self {
            Role::Updater => UPDATER_CONTAINER_NAME,
            Role::Supervisor => SUPERVISOR_CONTAINER_NAME,
        }
    }

    /// Image ref this role should run, out of a ref pair.
    pub fn image_ref<'a>(&self, refs: &'a ImageRefs) -> &'a str {
        match self {
            Role::Updater => &refs.updater,
            Role::Supervisor => &refs.supervisor,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the launch descriptor for `role` running `image_ref`.
pub fn launch_config(
    role: Role,
    config: &Config,
    image_ref: &str,
    refs: &ImageRefs,
) -> ContainerConfig {
    match role {
        Role::Updater => updater_launch_config(config, image_ref, refs),
        Role::Supervisor => supervisor_launch_config(config, image_ref, refs),
    }
}

pub fn updater_launch_config(config: &Config, image_ref: &str, refs: &ImageRefs) -> ContainerConfig {
    ContainerConfig {
        name: UPDATER_CONTAINER_NAME.to_string(),
        image: image_ref.to_string(),
        cmd: vec![NODE_BINARY_PATH.to_string(), "updater".to_string()],
        env: BTreeMap::from([
            (ENV_DEVELOPMENT.to_string(), config.development.to_string()),
            (ENV_RELEASE_INFO.to_string(), refs.release_info_env()),
        ]),
        volumes: BTreeMap::from([(config.node_dir.clone(), CONTAINER_NODE_DIR.to_string())]),
        ports: vec![
            (CONTAINER_PORT.to_string(), CONTAINER_PORT.to_string()),
            // random host port
            (String::new(), HEALTH_PORT.to_string()),
        ],
        files: BTreeMap::new(),
        dial_host: false,
        max_log_size: config.log.max_log_size.clone(),
        max_log_files: config.log.max_log_files,
    }
}

pub fn supervisor_launch_config(
    config: &Config,
    image_ref: &str,
    refs: &ImageRefs,
) -> ContainerConfig {
    ContainerConfig {
        name: SUPERVISOR_CONTAINER_NAME.to_string(),
        image: image_ref.to_string(),
        cmd: vec![NODE_BINARY_PATH.to_string(), "supervisor".to_string()],
        env: BTreeMap::from([
            // the supervisor mounts the host node dir into the containers it launches
            (ENV_HOST_NODE_DIR.to_string(), config.node_dir.clone()),
            (ENV_RELEASE_INFO.to_string(), refs.release_info_env()),
        ]),
        volumes: BTreeMap::from([
            (DOCKER_SOCKET_PATH.to_string(), DOCKER_SOCKET_PATH.to_string()),
            (config.node_dir.clone(), CONTAINER_NODE_DIR.to_string()),
        ]),
        ports: vec![(String::new(), HEALTH_PORT.to_string())],
        files: BTreeMap::from([(
            PASSPHRASE_FILE.to_string(),
            config.passphrase.as_bytes().to_vec(),
        )]),
        dial_host: true,
        max_log_size: config.log.max_log_size.clone(),
        max_log_files: config.log.max_log_files,
    }
}
