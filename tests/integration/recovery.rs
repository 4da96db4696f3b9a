//! Integration test: pending-cleanup recovery.
//!
//! Deferred teardown steps are replayed when their node comes back, retried
//! with backoff on agent errors, and never resurrect a deleted volume.

use std::time::Duration;

use reef_integration_tests::{IntegrationCluster, volume_spec};
use reef_types::{Protocol, VolumeId, VolumeStatus};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Several volumes deleted while two nodes are down drain once both return.
#[tokio::test]
async fn test_ledger_drains_after_outage() {
    let c = IntegrationCluster::new(4).await;
    let mut ids = Vec::new();
    for i in 0..6 {
        let volume = c
            .published_volume(&format!("vol-{i}"), 3, i % 4, Protocol::Nvmf)
            .await;
        ids.push(volume.id);
    }

    c.kill_node(1);
    c.kill_node(3);
    for id in &ids {
        c.service().delete_volume(id).await.unwrap();
        assert!(c.volume_gone(id));
    }
    assert!(!c.pending().is_empty());

    // Entries for nodes still down are left alone.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        c.pending()
            .iter()
            .all(|e| e.attempts == 0 && (e.task.node() == &c.node_id(1) || e.task.node() == &c.node_id(3)))
    );

    c.revive_node(1);
    c.revive_node(3);
    assert!(c.wait_for_empty_ledger(DRAIN_TIMEOUT).await);
    assert_eq!(c.physical_objects().await, 0);
    for id in &ids {
        assert!(c.volume_gone(id));
    }
}

/// A node that keeps failing is retried until it stops failing.
#[tokio::test]
async fn test_agent_errors_retried_with_backoff() {
    let c = IntegrationCluster::new(2).await;
    let id = VolumeId::new("flaky");
    c.service().put_volume(&id, volume_spec(2)).await.unwrap();

    c.agent(1).fail_next(3);
    c.service().delete_volume(&id).await.unwrap();
    assert!(c.volume_gone(&id));

    assert!(c.wait_for_empty_ledger(DRAIN_TIMEOUT).await);
    assert_eq!(c.agent(1).replica_count(), 0);
    assert!(c.worker().failed() >= 2);
}

/// Degraded while a replica node is down, healthy once it returns.
#[tokio::test]
async fn test_degraded_follows_reachability() {
    let c = IntegrationCluster::new(3).await;
    let id = VolumeId::new("health");
    c.service().put_volume(&id, volume_spec(2)).await.unwrap();

    c.kill_node(1);
    wait_for_status(&c, &id, VolumeStatus::Degraded).await;

    c.revive_node(1);
    wait_for_status(&c, &id, VolumeStatus::Created).await;
}

/// Re-creating a deleted volume while its old replica is still pending
/// cleanup: the replay removes only the stale replica.
#[tokio::test]
async fn test_recreate_before_cleanup_drains() {
    let c = IntegrationCluster::new(2).await;
    let id = VolumeId::new("phoenix");
    let first = c.service().put_volume(&id, volume_spec(2)).await.unwrap();

    c.kill_node(1);
    c.service().delete_volume(&id).await.unwrap();
    let stale = first.replicas.iter().find(|r| r.node == c.node_id(1)).unwrap().clone();

    // Bring the node back only in the registry; the replay keeps failing
    // until the agent is online again.
    c.registry().mark_reachable(&c.node_id(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(c.pending().len(), 1);

    c.agent(1).set_online(true);
    let second = c.service().put_volume(&id, volume_spec(2)).await.unwrap();
    let fresh = second.replicas.iter().find(|r| r.node == c.node_id(1)).unwrap().clone();
    assert_ne!(stale.id, fresh.id);

    assert!(c.wait_for_empty_ledger(DRAIN_TIMEOUT).await);
    assert!(!c.agent(1).has_replica(&stale.id));
    assert!(c.agent(1).has_replica(&fresh.id));
    assert_eq!(c.service().get_volume(&id).unwrap().status, VolumeStatus::Created);
}

/// Stopping the worker leaves the ledger intact for the next start.
#[tokio::test]
async fn test_worker_shutdown_keeps_ledger() {
    let mut c = IntegrationCluster::new(2).await;
    let id = VolumeId::new("parked");
    c.service().put_volume(&id, volume_spec(2)).await.unwrap();
    c.kill_node(0);
    c.service().delete_volume(&id).await.unwrap();

    c.shutdown().await;
    c.revive_node(0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(c.pending().len(), 1);

    let report = c.worker().replay_node(&c.node_id(0)).await;
    assert_eq!(report.removed, 1);
    assert!(c.pending().is_empty());
}

async fn wait_for_status(c: &IntegrationCluster, id: &VolumeId, status: VolumeStatus) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while c.service().get_volume(id).unwrap().status != status {
        assert!(
            tokio::time::Instant::now() < deadline,
            "volume never became {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
