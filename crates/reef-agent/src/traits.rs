//! Core trait and types for per-node storage agents.

use reef_types::{Nexus, NexusId, NodeId, Pool, PoolId, Protocol, Replica, ReplicaId};

use crate::error::AgentError;

/// Snapshot of the objects an agent currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Pools on the node.
    pub pools: Vec<PoolId>,
    /// Replicas on the node.
    pub replicas: Vec<ReplicaId>,
    /// Nexuses on the node, with their endpoint if shared.
    pub nexuses: Vec<(NexusId, Option<String>)>,
}

impl Inventory {
    /// Whether the agent holds no replica and no nexus.
    pub fn is_clean(&self) -> bool {
        self.replicas.is_empty() && self.nexuses.is_empty()
    }
}

/// The storage agent running on one node.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Destroy and unshare operations are idempotent: acting on an object that
/// is already gone succeeds.
#[async_trait::async_trait]
pub trait NodeAgent: Send + Sync {
    /// Node this agent runs on.
    fn node_id(&self) -> &NodeId;

    /// Create a pool. Re-creating an identical pool succeeds.
    async fn create_pool(&self, pool: &Pool) -> Result<(), AgentError>;

    /// Carve a replica of `size` bytes out of `replica.pool`.
    async fn create_replica(&self, replica: &Replica, size: u64) -> Result<(), AgentError>;

    /// Remove a replica.
    async fn destroy_replica(&self, id: &ReplicaId) -> Result<(), AgentError>;

    /// Create a nexus over its child replicas.
    async fn create_nexus(&self, nexus: &Nexus, size: u64) -> Result<(), AgentError>;

    /// Share a nexus over `protocol`, returning the endpoint URI.
    async fn share_nexus(&self, id: &NexusId, protocol: Protocol) -> Result<String, AgentError>;

    /// Remove a nexus's protocol endpoint.
    async fn unshare_nexus(&self, id: &NexusId) -> Result<(), AgentError>;

    /// Remove a nexus, unsharing it first if needed.
    async fn destroy_nexus(&self, id: &NexusId) -> Result<(), AgentError>;

    /// List the objects held by this agent.
    async fn inventory(&self) -> Result<Inventory, AgentError>;
}
