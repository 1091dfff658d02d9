//! Background workers driving a service on the wall clock.

mod common;

use std::time::Duration;

use common::*;
use shoal_controller::{ControllerConfig, ServiceUpdate};
use shoal_state::{EventKind, RolloutStatus, StateStore};
use tokio::sync::{broadcast, watch};

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        tick_interval: Duration::from_millis(20),
        health_interval: Duration::from_millis(20),
        autoscale_interval: Duration::from_secs(3600),
        ..test_config()
    }
}

async fn wait_for_completion(
    rx: &mut broadcast::Receiver<shoal_state::DeploymentEvent>,
    service: &str,
    version: u64,
) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.service_id == service
                        && matches!(event.kind, EventKind::RolloutCompleted { version: v, .. } if v == version)
                    {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "rollout of {service} v{version} did not complete");
}

#[tokio::test]
async fn workers_drive_rollouts_until_shutdown() {
    let h = Harness::with_store(StateStore::open_in_memory().unwrap(), fast_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    h.fleet.spawn_workers(shutdown_rx).await;
    let mut events = h.fleet.subscribe();

    let (id, v1) = h.service("web", "web:1", 2, policy(200, 100)).await;
    wait_for_completion(&mut events, &id, v1).await;

    let v2 = h.fleet.submit(definition("web:2")).unwrap();
    h.fleet
        .update_service(
            &id,
            ServiceUpdate {
                version: Some(v2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_for_completion(&mut events, &id, v2).await;

    let snap = h.fleet.describe_service(&id).await.unwrap();
    assert_eq!(snap.rollout, RolloutStatus::Completed);
    assert_eq!(healthy(&snap, v2), 2);
    assert_eq!(running(&snap, v1), 0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.fleet.join_workers())
        .await
        .expect("workers did not stop");
}
