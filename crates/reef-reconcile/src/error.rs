//! Error types for volume operations.

use reef_agent::ManagerError;
use reef_types::{NodeId, VolumeId};

/// Errors returned by [`VolumeService`](crate::VolumeService) operations.
///
/// `delete_volume` never returns [`VolumeError::NodeUnreachable`]: node-level
/// failures during deletion are absorbed into the pending-cleanup ledger.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// No volume with that id.
    #[error("volume not found: {0}")]
    NotFound(VolumeId),

    /// An incompatible operation is in progress or the request contradicts
    /// existing state.
    #[error("conflict on {resource}: {reason}")]
    Conflict {
        /// The volume or pool the request targeted.
        resource: String,
        /// What conflicted.
        reason: String,
    },

    /// A node needed by a non-delete operation is unreachable.
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeId),

    /// Not enough pools on distinct reachable nodes for the replica count.
    #[error("insufficient pools: need {needed}, found {available}")]
    InsufficientPools {
        /// Replicas requested.
        needed: usize,
        /// Eligible pools found.
        available: usize,
    },

    /// The request itself is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unexpected manager or agent failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] reef_meta::MetaError),
}

impl VolumeError {
    pub(crate) fn conflict(resource: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ManagerError> for VolumeError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::NodeUnreachable(node) => Self::NodeUnreachable(node),
            other @ ManagerError::Agent { .. } => Self::Internal(other.to_string()),
        }
    }
}
