//! Integration tests for runner start-up and shutdown.
//!
//! Uses MockRuntime and an in-process image store.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{test_config, Harness, StubProbe};
use node_runner::error::{ReplaceStep, RunnerError};
use node_runner::health::HealthCheck;
use node_runner::images::{ImageRefs, ImageStore};
use node_runner::launch::Role;
use node_runner::runner::Runner;
use node_runner::runtime::{ContainerState, MockRuntime, RuntimeOp};
use tokio::sync::watch;

fn embedded() -> ImageRefs {
    ImageRefs::new("sup:embedded", "upd:embedded")
}

#[tokio::test]
async fn test_auto_update_disabled_launches_embedded_supervisor_only() {
    let h = Harness::new(test_config(false), embedded());

    h.runner.start().await.unwrap();

    assert_eq!(h.runtime.count(RuntimeOp::Nuke), 1);
    assert_eq!(h.started(), vec![Role::Supervisor.container_name().to_string()]);
    let state = h.runner.containers().snapshot().await;
    assert_eq!(state.supervisor.image_ref.as_deref(), Some("sup:embedded"));
    assert!(state.updater.container.is_none());

    // nobody subscribed to image updates
    assert!(h.store.latest().is_ok());
}

#[tokio::test]
async fn test_auto_update_enabled_launches_embedded_updater() {
    let h = Harness::new(test_config(true), embedded());

    h.runner.start().await.unwrap();

    assert_eq!(h.started(), vec![Role::Updater.container_name().to_string()]);
    let state = h.runner.containers().snapshot().await;
    assert_eq!(state.updater.image_ref.as_deref(), Some("upd:embedded"));
    assert!(state.supervisor.container.is_none());
    assert!(h.store.latest().is_err());
}

#[tokio::test]
async fn test_cleanup_runs_before_any_launch() {
    let h = Harness::new(test_config(false), embedded());

    h.runner.start().await.unwrap();

    let ops: Vec<RuntimeOp> = h.runtime.calls().into_iter().map(|c| c.op).collect();
    assert_eq!(ops[0], RuntimeOp::ListContainers);
    assert_eq!(ops[1], RuntimeOp::Nuke);
    assert_eq!(ops[2], RuntimeOp::EnsureLocalImage);
}

#[tokio::test]
async fn test_unreachable_scan_api_aborts_start() {
    let h = Harness::with_probe(
        test_config(true),
        embedded(),
        StubProbe { fail_scan: true },
    );

    let err = h.runner.start().await.unwrap_err();

    assert!(matches!(err, RunnerError::StartupCheck(_)));
    assert!(err.to_string().contains("scan api check failed"));
    assert_eq!(h.runtime.count(RuntimeOp::Nuke), 0);
    assert!(h.started().is_empty());
}

#[tokio::test]
async fn test_nuke_failure_aborts_start() {
    let h = Harness::new(test_config(false), embedded());
    h.runtime.fail(RuntimeOp::Nuke);

    let err = h.runner.start().await.unwrap_err();

    assert!(matches!(err, RunnerError::Nuke(_)));
    assert!(h.started().is_empty());
}

#[tokio::test]
async fn test_embedded_launch_failure_is_returned() {
    let h = Harness::new(test_config(false), embedded());
    h.runtime.fail(RuntimeOp::WaitContainerStart);

    let err = h.runner.start().await.unwrap_err();

    match err {
        RunnerError::EmbeddedLaunch { role, source } => {
            assert_eq!(role, Role::Supervisor);
            assert_eq!(source.step, ReplaceStep::ConfirmStart);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_health_tracks_expected_roles() {
    let h = Harness::new(test_config(false), embedded());
    h.runner.start().await.unwrap();

    let report = h.runner.check_health().await;
    assert!(report.is_healthy());
    let updater = report.roles.iter().find(|r| r.role == "updater").unwrap();
    assert!(!updater.expected);

    let id = h.runner.containers().snapshot().await.supervisor.container.unwrap().id;
    h.runtime.set_state(&id, ContainerState::Exited);

    let report = h.runner.check_health().await;
    assert!(!report.is_healthy());
    assert_eq!(report.status, "degraded");
}

#[tokio::test]
async fn test_stop_asks_running_containers_to_stop() {
    let h = Harness::new(test_config(false), embedded());
    h.runner.start().await.unwrap();
    h.runtime.clear_calls();

    h.runner.stop().await;

    let stops = h.runtime.calls_for(RuntimeOp::StopContainer);
    assert_eq!(stops.len(), 1);
    let id = h.runner.containers().snapshot().await.supervisor.container.unwrap().id;
    assert_eq!(stops[0].target, id);
    assert_eq!(h.runner.name(), "runner");
}

#[tokio::test]
async fn test_embedded_images_bring_up_supervisor_with_auto_update() {
    let runtime = Arc::new(MockRuntime::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let fatal = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorded = fatal.clone();

    let config = test_config(true);
    let embedded = config.images.clone();
    let (runner, _publisher) = Runner::with_embedded_images(
        config,
        runtime.clone(),
        Arc::new(StubProbe::default()),
        shutdown_rx,
    );
    let runner = runner.with_fatal_handler(Arc::new(move |err: &RunnerError| {
        recorded.lock().unwrap().push(err.to_string());
    }));

    runner.start().await.unwrap();

    let wait = async {
        loop {
            let state = runner.containers().snapshot().await;
            let supervisor_up = state.supervisor.image_ref.as_deref()
                == Some(embedded.supervisor.as_str());
            if supervisor_up && runner.check_health().await.is_healthy() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let state = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("supervisor never launched");

    assert_eq!(state.updater.image_ref.as_deref(), Some(embedded.updater.as_str()));
    assert!(state.supervisor.container.is_some());
    assert!(fatal.lock().unwrap().is_empty());
}
