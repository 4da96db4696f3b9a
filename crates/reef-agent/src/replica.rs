//! Replica manager: pool-backed replica objects on storage nodes.

use std::sync::Arc;
use std::time::Duration;

use reef_cluster::NodeRegistry;
use reef_types::{Pool, Replica};
use tracing::{debug, instrument};

use crate::directory::{AgentDirectory, NodeGate};
use crate::error::ManagerError;

/// Creates and destroys replicas (and the pools they live in).
///
/// Every call is gated by node reachability and bounded by the operation
/// timeout; see [`ManagerError`] for the classification.
#[derive(Clone)]
pub struct ReplicaManager {
    gate: NodeGate,
}

impl ReplicaManager {
    /// Create a manager over the given registry and agents.
    pub fn new(
        registry: Arc<NodeRegistry>,
        agents: Arc<AgentDirectory>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            gate: NodeGate::new(registry, agents, operation_timeout),
        }
    }

    /// Create a pool on its node.
    pub async fn create_pool(&self, pool: &Pool) -> Result<(), ManagerError> {
        self.gate
            .call(&pool.node, "create_pool", |agent| async move {
                agent.create_pool(pool).await
            })
            .await?;
        debug!(pool = %pool.id, node = %pool.node, "pool created");
        Ok(())
    }

    /// Create a replica of `size` bytes.
    pub async fn create_replica(&self, replica: &Replica, size: u64) -> Result<(), ManagerError> {
        self.gate
            .call(&replica.node, "create_replica", |agent| async move {
                agent.create_replica(replica, size).await
            })
            .await?;
        debug!(replica = %replica.id, node = %replica.node, "replica created");
        Ok(())
    }

    /// Destroy a replica. Destroying an already-gone replica succeeds.
    #[instrument(skip_all, fields(replica = %replica.id.short(), node = %replica.node))]
    pub async fn destroy_replica(&self, replica: &Replica) -> Result<(), ManagerError> {
        let id = replica.id;
        self.gate
            .call(&replica.node, "destroy_replica", |agent| async move {
                agent.destroy_replica(&id).await
            })
            .await?;
        debug!("replica destroyed");
        Ok(())
    }
}
