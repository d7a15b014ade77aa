//! Shared fixtures for runner integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use node_runner::config::Config;
use node_runner::error::RunnerError;
use node_runner::images::{ChannelImageStore, ImageRefPublisher, ImageRefs};
use node_runner::launch::Role;
use node_runner::probes::EnvironmentProbe;
use node_runner::runner::{FatalHandler, Runner};
use node_runner::runtime::{MockRuntime, RuntimeOp};
use tokio::sync::watch;

/// Probe that succeeds unless told otherwise.
#[derive(Default)]
pub struct StubProbe {
    pub fail_scan: bool,
}

#[async_trait]
impl EnvironmentProbe for StubProbe {
    async fn check_json_rpc(&self, _url: &str) -> anyhow::Result<u64> {
        if self.fail_scan {
            anyhow::bail!("connection refused");
        }
        Ok(1)
    }

    async fn post_test_batch(&self, _api_url: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn test_config(auto_update: bool) -> Config {
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.development = true;
    config.auto_update.disable = !auto_update;
    config.health_addr = "127.0.0.1:0".parse().unwrap();
    config
}

/// A runner wired to in-memory collaborators.
pub struct Harness {
    pub runtime: Arc<MockRuntime>,
    pub store: Arc<ChannelImageStore>,
    pub publisher: Option<ImageRefPublisher>,
    pub runner: Runner,
    pub fatal: Arc<Mutex<Vec<String>>>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    pub fn new(config: Config, embedded: ImageRefs) -> Self {
        Self::with_probe(config, embedded, StubProbe::default())
    }

    pub fn with_probe(config: Config, embedded: ImageRefs, probe: StubProbe) -> Self {
        let runtime = Arc::new(MockRuntime::new());
        let (store, publisher) = ChannelImageStore::new(embedded);
        let store = Arc::new(store);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let fatal = Arc::new(Mutex::new(Vec::new()));
        let recorded = fatal.clone();
        let on_fatal: FatalHandler = Arc::new(move |err: &RunnerError| {
            recorded.lock().unwrap().push(err.to_string());
        });

        let runner = Runner::new(
            config,
            runtime.clone(),
            store.clone(),
            Arc::new(probe),
            shutdown_rx,
        )
        .with_fatal_handler(on_fatal);

        Self {
            runtime,
            store,
            publisher: Some(publisher),
            runner,
            fatal,
            shutdown_tx,
        }
    }

    pub fn publish(&self, supervisor: &str, updater: &str) {
        self.publisher
            .as_ref()
            .expect("image stream already closed")
            .publish(ImageRefs::new(supervisor, updater))
            .unwrap();
    }

    /// Close the image stream and wait for the update loop to drain it.
    pub async fn finish_updates(&mut self) {
        self.publisher.take();
        tokio::time::timeout(Duration::from_secs(5), self.runner.join_update_loop())
            .await
            .expect("update loop did not finish");
    }

    /// Wait until `role` records `image_ref`.
    pub async fn wait_for_ref(&self, role: Role, image_ref: &str) {
        let wait = async {
            loop {
                let state = self.runner.containers().snapshot().await;
                if state.slot(role).image_ref.as_deref() == Some(image_ref) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("image ref never recorded");
    }

    /// Container names passed to start commands, in order.
    pub fn started(&self) -> Vec<String> {
        self.runtime
            .calls_for(RuntimeOp::StartContainer)
            .into_iter()
            .map(|c| c.target)
            .collect()
    }

    pub fn starts_of(&self, role: Role) -> usize {
        self.started()
            .iter()
            .filter(|name| name.as_str() == role.container_name())
            .count()
    }

    pub fn fatal_errors(&self) -> Vec<String> {
        self.fatal.lock().unwrap().clone()
    }
}
