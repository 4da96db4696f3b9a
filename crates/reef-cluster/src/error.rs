//! Error types for the cluster crate.

use reef_types::NodeId;

/// Errors produced by the node registry.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The requested node was never registered.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
}
