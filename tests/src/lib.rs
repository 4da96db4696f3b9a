//! Shared test harness for Reef integration tests.
//!
//! Provides [`IntegrationCluster`]: an N-node cluster of in-memory storage
//! agents behind a node registry, a volume service over a temporary
//! metadata store, and a running recovery worker. Nodes can be killed and
//! revived; a killed node's agent refuses every call and the registry sees
//! it as unreachable.

use std::sync::Arc;
use std::time::Duration;

use reef_agent::{AgentDirectory, MemoryAgent, NodeAgent, SlowAgent};
use reef_cluster::NodeRegistry;
use reef_meta::MetaStore;
use reef_reconcile::{RecoveryWorker, VolumeService};
use reef_types::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Volume size used by [`volume_spec`].
pub const VOLUME_SIZE: u64 = 10_485_760;

/// A spec with `replicas` replicas and no self-heal.
pub fn volume_spec(replicas: u8) -> VolumeSpec {
    VolumeSpec {
        size: VOLUME_SIZE,
        replicas,
        policy: VolumePolicy::default(),
    }
}

/// A running control plane over in-memory agents.
pub struct IntegrationCluster {
    node_ids: Vec<NodeId>,
    agents: Vec<Arc<MemoryAgent>>,
    registry: Arc<NodeRegistry>,
    service: Arc<VolumeService>,
    worker: Arc<RecoveryWorker>,
    shutdown_tx: watch::Sender<bool>,
    worker_task: Option<JoinHandle<()>>,
}

impl IntegrationCluster {
    /// Create an `n`-node cluster with one pool per node and a running
    /// recovery worker.
    pub async fn new(n: usize) -> Self {
        Self::build(n, None).await
    }

    /// Like [`Self::new`], but every agent call takes between `min_ms` and
    /// `max_ms` (seeded per node).
    pub async fn with_latency(n: usize, min_ms: u64, max_ms: u64, seed: u64) -> Self {
        Self::build(n, Some((min_ms, max_ms, seed))).await
    }

    async fn build(n: usize, latency: Option<(u64, u64, u64)>) -> Self {
        assert!(n >= 1, "need at least 1 node");

        let registry = NodeRegistry::new();
        let directory = AgentDirectory::new();
        let mut node_ids = Vec::with_capacity(n);
        let mut agents = Vec::with_capacity(n);

        for i in 0..n {
            let node_id = NodeId::new(format!("node-{i}"));
            let agent = Arc::new(MemoryAgent::new(node_id.clone()));
            match latency {
                Some((min_ms, max_ms, seed)) => directory.insert(Arc::new(
                    SlowAgent::new(agent.clone())
                        .latency(min_ms, max_ms)
                        .seed(seed.wrapping_add(i as u64)),
                )),
                None => directory.insert(agent.clone()),
            }
            registry.register(node_id.clone());
            node_ids.push(node_id);
            agents.push(agent);
        }

        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        let service = VolumeService::new(
            meta,
            registry.clone(),
            directory,
            ReconcileConfig::test_config(),
        );
        for node_id in &node_ids {
            service
                .put_node_pool(
                    node_id,
                    &PoolId::new(format!("{node_id}-pool")),
                    vec![format!("malloc:///{node_id}?size_mb=64")],
                )
                .await
                .unwrap();
        }

        let worker = RecoveryWorker::new(service.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_task = tokio::spawn(worker.clone().run(registry.subscribe(), shutdown_rx));

        Self {
            node_ids,
            agents,
            registry,
            service,
            worker,
            shutdown_tx,
            worker_task: Some(worker_task),
        }
    }

    /// The volume service.
    pub fn service(&self) -> &Arc<VolumeService> {
        &self.service
    }

    /// The recovery worker.
    pub fn worker(&self) -> &Arc<RecoveryWorker> {
        &self.worker
    }

    /// The node registry.
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// NodeId of node `i`.
    pub fn node_id(&self, i: usize) -> NodeId {
        self.node_ids[i].clone()
    }

    /// Agent of node `i`.
    pub fn agent(&self, i: usize) -> &Arc<MemoryAgent> {
        &self.agents[i]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Returns `true` if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Index of the node with id `node`.
    pub fn index_of(&self, node: &NodeId) -> usize {
        self.node_ids
            .iter()
            .position(|n| n == node)
            .expect("unknown node")
    }

    /// Take node `i` down: its agent refuses calls and the registry marks it
    /// unreachable.
    pub fn kill_node(&self, i: usize) {
        self.agents[i].set_online(false);
        self.registry.mark_unreachable(&self.node_ids[i]).unwrap();
    }

    /// Bring node `i` back. The registry transition triggers a ledger replay
    /// for the node.
    pub fn revive_node(&self, i: usize) {
        self.agents[i].set_online(true);
        self.registry.mark_reachable(&self.node_ids[i]).unwrap();
    }

    /// Current pending-cleanup ledger.
    pub fn pending(&self) -> Vec<PendingCleanup> {
        self.service.pending_cleanups().unwrap()
    }

    /// Whether `get_volume` reports not-found.
    pub fn volume_gone(&self, id: &VolumeId) -> bool {
        matches!(
            self.service.get_volume(id),
            Err(reef_reconcile::VolumeError::NotFound(_))
        )
    }

    /// Replicas and nexuses still present on every online agent.
    pub async fn physical_objects(&self) -> usize {
        let mut total = 0;
        for agent in &self.agents {
            if let Ok(inventory) = agent.inventory().await {
                total += inventory.replicas.len() + inventory.nexuses.len();
            }
        }
        total
    }

    /// Poll until the ledger is empty or `timeout` elapses.
    pub async fn wait_for_empty_ledger(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Create a volume and publish it on node `target` over `protocol`.
    pub async fn published_volume(
        &self,
        id: &str,
        replicas: u8,
        target: usize,
        protocol: Protocol,
    ) -> Volume {
        let id = VolumeId::new(id);
        self.service
            .put_volume(&id, volume_spec(replicas))
            .await
            .unwrap();
        self.service
            .put_volume_target(&id, &self.node_ids[target], protocol)
            .await
            .unwrap()
    }

    /// Stop the recovery worker and wait for it to exit.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.worker_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IntegrationCluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
