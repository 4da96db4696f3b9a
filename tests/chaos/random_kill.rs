//! Chaos test: random node failures during volume churn.
//!
//! Nodes are killed and revived at random (seeded) while volumes are deleted
//! and created. Every delete must succeed and remove the record at once;
//! once all nodes are back the ledger must drain and no replica or nexus
//! may be left on any agent.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reef_integration_tests::{IntegrationCluster, volume_spec};
use reef_reconcile::{DeleteOutcome, VolumeError};
use reef_types::{Protocol, VolumeId};

const NODES: usize = 5;
const SEED: u64 = 42;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_kill_during_churn() {
    let c = IntegrationCluster::with_latency(NODES, 1, 10, SEED).await;
    let mut rng = StdRng::seed_from_u64(SEED);

    // Steady state: every node up, half the volumes published.
    let mut live = Vec::new();
    for i in 0..20 {
        let replicas = rng.random_range(1..=3u8);
        let id = if i % 2 == 0 {
            let protocol = if rng.random_bool(0.5) {
                Protocol::Nvmf
            } else {
                Protocol::Iscsi
            };
            c.published_volume(&format!("vol-{i:02}"), replicas, i % NODES, protocol)
                .await
                .id
        } else {
            let id = VolumeId::new(format!("vol-{i:02}"));
            c.service().put_volume(&id, volume_spec(replicas)).await.unwrap();
            id
        };
        live.push(id);
    }

    let mut down = [false; NODES];
    let mut deleted = Vec::new();
    let mut next = 20;
    for _ in 0..60 {
        let node = rng.random_range(0..NODES);
        if down[node] {
            c.revive_node(node);
        } else {
            c.kill_node(node);
        }
        down[node] = !down[node];

        if !live.is_empty() && rng.random_bool(0.7) {
            let id = live.swap_remove(rng.random_range(0..live.len()));
            let outcome = c.service().delete_volume(&id).await.unwrap();
            assert!(matches!(outcome, DeleteOutcome::Deleted(_)), "{id}: {outcome:?}");
            assert!(c.volume_gone(&id));
            deleted.push(id);
        } else {
            let id = VolumeId::new(format!("vol-{next:02}"));
            next += 1;
            match c
                .service()
                .put_volume(&id, volume_spec(rng.random_range(1..=2u8)))
                .await
            {
                Ok(_) => live.push(id),
                Err(VolumeError::NodeUnreachable(_) | VolumeError::InsufficientPools { .. }) => {
                    assert!(c.volume_gone(&id), "{id} survived a failed create");
                }
                Err(e) => panic!("unexpected create failure for {id}: {e}"),
            }
        }
    }

    for (node, is_down) in down.iter().enumerate() {
        if *is_down {
            c.revive_node(node);
        }
    }

    // Deleted volumes stay deleted while their cleanup drains.
    for id in &deleted {
        assert!(c.volume_gone(id));
        assert_eq!(
            c.service().delete_volume(id).await.unwrap(),
            DeleteOutcome::NotFound
        );
    }

    for id in live.drain(..) {
        c.service().delete_volume(&id).await.unwrap();
        assert!(c.volume_gone(&id));
    }

    assert!(
        c.wait_for_empty_ledger(Duration::from_secs(10)).await,
        "ledger did not drain: {:?}",
        c.pending()
    );
    assert_eq!(c.physical_objects().await, 0);
    assert!(c.service().list_volumes().unwrap().is_empty());
}
