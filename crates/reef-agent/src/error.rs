//! Error types for node agents and the managers driving them.

use reef_types::{NexusId, NodeId, PoolId};

/// Errors reported by a node's storage agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The agent could not be contacted.
    #[error("agent unavailable on node {0}")]
    Unavailable(NodeId),

    /// The pool a replica should be carved from does not exist.
    #[error("pool not found: {0}")]
    PoolNotFound(PoolId),

    /// Pool exists with a different node or disk set.
    #[error("pool {0} already exists with a different configuration")]
    PoolMismatch(PoolId),

    /// The nexus does not exist (only for operations that need it).
    #[error("nexus not found: {0}")]
    NexusNotFound(NexusId),

    /// Nexus is already shared over a different protocol.
    #[error("nexus {0} is already shared")]
    AlreadyShared(NexusId),

    /// Any other agent-side failure.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Errors returned by [`ReplicaManager`](crate::ReplicaManager) and
/// [`NexusManager`](crate::NexusManager).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// The node is unreachable, has no agent, or did not answer in time.
    ///
    /// Retryable once the node recovers.
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeId),

    /// The agent answered with an error.
    #[error("agent error on node {node}: {source}")]
    Agent {
        /// Node that reported the error.
        node: NodeId,
        /// The agent's error.
        source: AgentError,
    },
}

impl ManagerError {
    /// Whether the failure is a reachability problem rather than an agent fault.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::NodeUnreachable(_))
    }
}
