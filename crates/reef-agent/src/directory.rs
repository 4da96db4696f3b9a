//! Agent lookup and the reachability gate shared by both managers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reef_cluster::NodeRegistry;
use reef_types::NodeId;
use tracing::{debug, warn};

use crate::error::{AgentError, ManagerError};
use crate::traits::NodeAgent;

/// Maps node IDs to the agent serving them.
#[derive(Default)]
pub struct AgentDirectory {
    agents: RwLock<HashMap<NodeId, Arc<dyn NodeAgent>>>,
}

impl AgentDirectory {
    /// Create an empty directory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) the agent for its node.
    pub fn insert(&self, agent: Arc<dyn NodeAgent>) {
        let node_id = agent.node_id().clone();
        debug!(%node_id, "agent registered");
        self.agents
            .write()
            .expect("lock poisoned")
            .insert(node_id, agent);
    }

    /// Look up the agent for `node_id`.
    pub fn get(&self, node_id: &NodeId) -> Option<Arc<dyn NodeAgent>> {
        self.agents
            .read()
            .expect("lock poisoned")
            .get(node_id)
            .cloned()
    }

    /// Node IDs that have an agent, ordered.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .agents
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Runs agent calls only against reachable nodes, bounded by a timeout.
///
/// Classification:
/// - node unreachable in the registry, no agent, or call timed out →
///   [`ManagerError::NodeUnreachable`] without touching the agent
///   (or abandoning it);
/// - agent answered [`AgentError::Unavailable`] → `NodeUnreachable`;
/// - any other agent error → [`ManagerError::Agent`].
#[derive(Clone)]
pub(crate) struct NodeGate {
    registry: Arc<NodeRegistry>,
    agents: Arc<AgentDirectory>,
    timeout: Duration,
}

impl NodeGate {
    pub(crate) fn new(
        registry: Arc<NodeRegistry>,
        agents: Arc<AgentDirectory>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            agents,
            timeout,
        }
    }

    pub(crate) async fn call<T, F, Fut>(
        &self,
        node: &NodeId,
        op: &'static str,
        f: F,
    ) -> Result<T, ManagerError>
    where
        F: FnOnce(Arc<dyn NodeAgent>) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        if !self.registry.is_reachable(node) {
            debug!(%node, op, "node unreachable, skipping call");
            return Err(ManagerError::NodeUnreachable(node.clone()));
        }
        let Some(agent) = self.agents.get(node) else {
            warn!(%node, op, "no agent registered for node");
            return Err(ManagerError::NodeUnreachable(node.clone()));
        };

        match tokio::time::timeout(self.timeout, f(agent)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(AgentError::Unavailable(_))) => {
                warn!(%node, op, "agent unavailable");
                Err(ManagerError::NodeUnreachable(node.clone()))
            }
            Ok(Err(source)) => Err(ManagerError::Agent {
                node: node.clone(),
                source,
            }),
            Err(_) => {
                warn!(%node, op, timeout_ms = self.timeout.as_millis() as u64, "agent call timed out");
                Err(ManagerError::NodeUnreachable(node.clone()))
            }
        }
    }
}
