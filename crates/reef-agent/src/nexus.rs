//! Nexus manager: the aggregation object and its protocol target.

use std::sync::Arc;
use std::time::Duration;

use reef_cluster::NodeRegistry;
use reef_types::{Nexus, Protocol, TargetDescriptor};
use tracing::{debug, instrument, warn};

use crate::directory::{AgentDirectory, NodeGate};
use crate::error::ManagerError;

/// A failed [`NexusManager::publish`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct PublishError {
    /// Why the publish failed.
    pub error: ManagerError,
    /// The nexus may still exist on its node.
    pub nexus_left: bool,
}

/// Creates, publishes, unpublishes and destroys nexuses.
///
/// Gating and error classification are identical to
/// [`ReplicaManager`](crate::ReplicaManager).
#[derive(Clone)]
pub struct NexusManager {
    gate: NodeGate,
}

impl NexusManager {
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

    /// Create the nexus and share it over `protocol`.
    ///
    /// If sharing fails the fresh nexus is destroyed again. When that
    /// destroy fails too, or a timed-out create may still have landed, the
    /// error reports [`PublishError::nexus_left`] so the caller can track
    /// the nexus for later cleanup.
    pub async fn publish(
        &self,
        nexus: &Nexus,
        size: u64,
        protocol: Protocol,
    ) -> Result<TargetDescriptor, PublishError> {
        if let Err(error) = self
            .gate
            .call(&nexus.node, "create_nexus", |agent| async move {
                agent.create_nexus(nexus, size).await
            })
            .await
        {
            let nexus_left = error.is_unreachable();
            return Err(PublishError { error, nexus_left });
        }

        let id = nexus.id;
        let shared = self
            .gate
            .call(&nexus.node, "share_nexus", |agent| async move {
                agent.share_nexus(&id, protocol).await
            })
            .await;

        match shared {
            Ok(endpoint) => {
                debug!(nexus = %nexus.id, node = %nexus.node, %endpoint, "nexus published");
                Ok(TargetDescriptor { protocol, endpoint })
            }
            Err(error) => {
                warn!(nexus = %nexus.id, node = %nexus.node, error = %error, "share failed, destroying nexus");
                let nexus_left = match self.destroy_nexus(nexus).await {
                    Ok(()) => false,
                    Err(cleanup) => {
                        warn!(nexus = %nexus.id, error = %cleanup, "failed to destroy unshared nexus");
                        true
                    }
                };
                Err(PublishError { error, nexus_left })
            }
        }
    }

    /// Remove the nexus's protocol endpoint. Idempotent.
    #[instrument(skip_all, fields(nexus = %nexus.id.short(), node = %nexus.node))]
    pub async fn unpublish_target(&self, nexus: &Nexus) -> Result<(), ManagerError> {
        let id = nexus.id;
        self.gate
            .call(&nexus.node, "unshare_nexus", |agent| async move {
                agent.unshare_nexus(&id).await
            })
            .await?;
        debug!("target unpublished");
        Ok(())
    }

    /// Remove the nexus, unpublishing it in the same step if still shared.
    /// Idempotent.
    #[instrument(skip_all, fields(nexus = %nexus.id.short(), node = %nexus.node))]
    pub async fn destroy_nexus(&self, nexus: &Nexus) -> Result<(), ManagerError> {
        let id = nexus.id;
        self.gate
            .call(&nexus.node, "destroy_nexus", |agent| async move {
                agent.destroy_nexus(&id).await
            })
            .await?;
        debug!("nexus destroyed");
        Ok(())
    }
}
