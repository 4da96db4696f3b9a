//! Integration test: volume deletion.
//!
//! Deletes volumes on clusters with every node up and with the replica or
//! nexus node down. The record must be gone once delete returns; physical
//! cleanup on a down node happens after it comes back.

use std::time::Duration;

use reef_agent::NodeAgent;
use reef_integration_tests::{IntegrationCluster, volume_spec};
use reef_reconcile::DeleteOutcome;
use reef_types::{CleanupTask, Protocol, VolumeId};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Unpublished volume: no nexus call at all, nothing left behind.
#[tokio::test]
async fn test_delete_unpublished_volume() {
    let c = IntegrationCluster::new(3).await;
    let id = VolumeId::new("unpublished");
    c.service().put_volume(&id, volume_spec(3)).await.unwrap();

    let outcome = c.service().delete_volume(&id).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::Deleted(_)));
    assert!(c.volume_gone(&id));

    for i in 0..c.len() {
        assert_eq!(c.agent(i).nexus_calls(), 0, "node {i} saw a nexus call");
    }
    assert_eq!(c.physical_objects().await, 0);
    assert!(c.pending().is_empty());
}

/// Published over nvmf on a reachable node: nexus and replicas torn down.
#[tokio::test]
async fn test_delete_published_nvmf_volume() {
    let c = IntegrationCluster::new(3).await;
    let volume = c.published_volume("published", 3, 1, Protocol::Nvmf).await;
    let nexus = volume.nexus.clone().unwrap();
    assert!(c.agent(1).is_shared(&nexus.id));

    c.service().delete_volume(&volume.id).await.unwrap();

    assert!(c.volume_gone(&volume.id));
    assert!(!c.agent(1).has_nexus(&nexus.id));
    assert_eq!(c.physical_objects().await, 0);
    assert!(c.pending().is_empty());
}

/// Target on a reachable node, one replica on a node that went down.
#[tokio::test]
async fn test_delete_with_replica_node_down() {
    let c = IntegrationCluster::new(3).await;
    let volume = c.published_volume("replica-down", 2, 0, Protocol::Nvmf).await;
    let stranded = volume
        .replicas
        .iter()
        .find(|r| r.node != c.node_id(0))
        .unwrap()
        .clone();
    let down = c.index_of(&stranded.node);

    c.kill_node(down);
    let outcome = c.service().delete_volume(&volume.id).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::Deleted(_)));
    assert!(c.volume_gone(&volume.id));

    // The replica outlives the record until its node returns.
    assert!(c.agent(down).has_replica(&stranded.id));
    let pending = c.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task, CleanupTask::DestroyReplica(stranded.clone()));

    c.revive_node(down);
    assert!(c.wait_for_empty_ledger(DRAIN_TIMEOUT).await);
    assert!(!c.agent(down).has_replica(&stranded.id));
    assert_eq!(c.physical_objects().await, 0);
    assert!(c.volume_gone(&volume.id));
}

/// Target and nexus on a node that went down.
#[tokio::test]
async fn test_delete_with_nexus_node_down() {
    let c = IntegrationCluster::new(3).await;
    // Replicas land on node-0 and node-1; the nexus lives alone on node-2.
    let volume = c.published_volume("nexus-down", 2, 2, Protocol::Nvmf).await;
    let nexus = volume.nexus.clone().unwrap();

    c.kill_node(2);
    c.service().delete_volume(&volume.id).await.unwrap();
    assert!(c.volume_gone(&volume.id));
    assert!(c.agent(2).has_nexus(&nexus.id));

    let pending = c.pending();
    assert_eq!(pending.len(), 1);
    assert!(matches!(pending[0].task, CleanupTask::DestroyNexus(ref n) if n.id == nexus.id));

    c.revive_node(2);
    assert!(c.wait_for_empty_ledger(DRAIN_TIMEOUT).await);
    assert!(!c.agent(2).has_nexus(&nexus.id));
    assert_eq!(c.physical_objects().await, 0);
}

/// Deleting twice: the second call observes not-found, nothing else
/// changes.
#[tokio::test]
async fn test_delete_twice() {
    let c = IntegrationCluster::new(2).await;
    let volume = c.published_volume("twice", 2, 0, Protocol::Iscsi).await;

    c.kill_node(1);
    assert!(matches!(
        c.service().delete_volume(&volume.id).await.unwrap(),
        DeleteOutcome::Deleted(_)
    ));
    let ledger = c.pending();

    assert_eq!(
        c.service().delete_volume(&volume.id).await.unwrap(),
        DeleteOutcome::NotFound
    );
    assert_eq!(c.pending(), ledger);
    assert!(c.volume_gone(&volume.id));
}

/// Every node reachable throughout: the ledger stays empty.
#[tokio::test]
async fn test_no_leaked_pending_entries() {
    let c = IntegrationCluster::new(4).await;
    let mut ids = Vec::new();
    for i in 0..12 {
        let id = format!("vol-{i:02}");
        if i % 2 == 0 {
            c.published_volume(&id, 1 + (i % 3) as u8, i % 4, Protocol::Nvmf)
                .await;
        } else {
            c.service()
                .put_volume(&VolumeId::new(&id), volume_spec(2))
                .await
                .unwrap();
        }
        ids.push(VolumeId::new(id));
    }

    for id in &ids {
        c.service().delete_volume(id).await.unwrap();
    }
    assert!(c.pending().is_empty());
    assert!(c.service().list_volumes().unwrap().is_empty());
    assert_eq!(c.physical_objects().await, 0);
}

/// `target` absent iff no nexus exists, across publish, unpublish and
/// delete.
#[tokio::test]
async fn test_target_iff_nexus_across_lifecycle() {
    let c = IntegrationCluster::new(3).await;

    let check = |c: &IntegrationCluster| {
        let volumes = c.service().list_volumes().unwrap();
        for v in &volumes {
            assert_eq!(v.target.is_some(), v.nexus.is_some(), "{v:?}");
        }
        volumes.iter().filter(|v| v.nexus.is_some()).count()
    };

    for i in 0..6 {
        c.service()
            .put_volume(&VolumeId::new(format!("v{i}")), volume_spec(2))
            .await
            .unwrap();
    }
    for i in 0..6 {
        c.service()
            .put_volume_target(&VolumeId::new(format!("v{i}")), &c.node_id(i % 3), Protocol::Nvmf)
            .await
            .unwrap();
    }
    for i in (0..6).step_by(2) {
        c.service()
            .del_volume_target(&VolumeId::new(format!("v{i}")))
            .await
            .unwrap();
    }
    let published = check(&c);
    assert_eq!(published, 3);
    assert_eq!(live_nexuses(&c).await, published);

    c.service().delete_volume(&VolumeId::new("v1")).await.unwrap();
    let published = check(&c);
    assert_eq!(published, 2);
    assert_eq!(live_nexuses(&c).await, published);
}

async fn live_nexuses(c: &IntegrationCluster) -> usize {
    let mut total = 0;
    for i in 0..c.len() {
        total += c.agent(i).inventory().await.unwrap().nexuses.len();
    }
    total
}

/// Concurrent deletes of one volume: exactly one performs the teardown.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deletes() {
    let c = IntegrationCluster::new(3).await;
    let volume = c.published_volume("racy", 3, 0, Protocol::Nvmf).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = c.service().clone();
        let id = volume.id.clone();
        handles.push(tokio::spawn(async move { service.delete_volume(&id).await }));
    }
    let mut deleted = 0;
    for handle in handles {
        if let DeleteOutcome::Deleted(_) = handle.await.unwrap().unwrap() {
            deleted += 1;
        }
    }
    assert_eq!(deleted, 1);
    assert!(c.volume_gone(&volume.id));
    assert!(c.pending().is_empty());
}
