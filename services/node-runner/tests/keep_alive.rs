//! Integration tests for the keep-alive loop.
//!
//! Time is paused, so ticks are driven by sleeping past the interval.

mod common;

use std::time::Duration;

use common::{test_config, Harness};
use node_runner::images::ImageRefs;
use node_runner::launch::{Role, SUPERVISOR_CONTAINER_NAME};
use node_runner::runtime::{ContainerState, RuntimeOp};

const TICK: Duration = Duration::from_secs(10);

fn harness(auto_update: bool) -> Harness {
    let mut config = test_config(auto_update);
    config.keep_alive_interval = TICK;
    Harness::new(config, ImageRefs::new("sup:v1", "upd:v1"))
}

#[tokio::test(start_paused = true)]
async fn test_exited_container_restarted_once_with_original_config() {
    let h = harness(false);
    h.runner.start().await.unwrap();
    let before = h.runner.containers().snapshot().await.supervisor;
    let container = before.container.clone().unwrap();
    h.runtime.set_state(&container.id, ContainerState::Exited);
    h.runtime.clear_calls();

    tokio::time::sleep(TICK + Duration::from_secs(1)).await;

    let restarts = h.runtime.calls_for(RuntimeOp::RestartContainer);
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].target, container.id);
    assert_eq!(h.runtime.count(RuntimeOp::StartContainer), 0);
    assert_eq!(
        h.runtime.config_of(SUPERVISOR_CONTAINER_NAME).unwrap(),
        container.config
    );

    let after = h.runner.containers().snapshot().await.supervisor;
    assert_eq!(after.image_ref, before.image_ref);
    assert_eq!(after.container.unwrap().id, container.id);

    // running again, so the next tick leaves it alone
    tokio::time::sleep(TICK).await;
    assert_eq!(h.runtime.count(RuntimeOp::RestartContainer), 1);
}

#[tokio::test(start_paused = true)]
async fn test_running_containers_are_only_queried() {
    let h = harness(true);
    h.runner.start().await.unwrap();
    h.runtime.clear_calls();

    tokio::time::sleep(TICK + Duration::from_secs(1)).await;

    assert_eq!(h.runtime.count(RuntimeOp::RestartContainer), 0);
    assert_eq!(h.runtime.count(RuntimeOp::StartContainer), 0);
    assert_eq!(h.runtime.count(RuntimeOp::GetContainerById), 1);
}

#[tokio::test(start_paused = true)]
async fn test_updater_restarted_when_auto_update_enabled() {
    let h = harness(true);
    h.runner.start().await.unwrap();
    let id = h
        .runner
        .containers()
        .snapshot()
        .await
        .slot(Role::Updater)
        .container
        .clone()
        .unwrap()
        .id;
    h.runtime.set_state(&id, ContainerState::Exited);
    h.runtime.clear_calls();

    tokio::time::sleep(TICK + Duration::from_secs(1)).await;

    let restarts = h.runtime.calls_for(RuntimeOp::RestartContainer);
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].target, id);
    assert_eq!(h.starts_of(Role::Updater), 0);
}

#[tokio::test(start_paused = true)]
async fn test_loop_stops_on_shutdown() {
    let h = harness(false);
    h.runner.start().await.unwrap();
    h.shutdown_tx.send(true).unwrap();
    tokio::task::yield_now().await;

    let id = h.runner.containers().snapshot().await.supervisor.container.unwrap().id;
    h.runtime.set_state(&id, ContainerState::Exited);
    h.runtime.clear_calls();

    tokio::time::sleep(TICK * 3).await;

    assert!(h.runtime.calls().is_empty());
}
