//! Node registry: the reachability view every manager consults.
//!
//! [`NodeRegistry`] is the shared, read-mostly structure that the replica
//! and nexus managers gate their calls on, and whose transitions drive the
//! recovery path through [`ClusterEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use reef_types::{ClusterEvent, Node, NodeId, NodeState, unix_millis};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::ClusterError;

/// Tracks the reachability of every known storage node.
///
/// Reads are synchronous and reflect the most recently processed signal.
/// Only real transitions are broadcast; a repeated signal for a node already
/// in the requested state is absorbed.
pub struct NodeRegistry {
    /// Known nodes, keyed by node ID.
    nodes: RwLock<HashMap<NodeId, Node>>,
    /// Broadcast channel for reachability events.
    ///
    /// Subscribers: recovery worker, degraded tracker.
    event_tx: broadcast::Sender<ClusterEvent>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            event_tx,
        })
    }

    /// Subscribe to reachability events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }

    /// Add a node as reachable. Returns `false` if it was already known.
    pub fn register(&self, node_id: NodeId) -> bool {
        {
            let mut nodes = self.nodes.write().expect("lock poisoned");
            if nodes.contains_key(&node_id) {
                return false;
            }
            nodes.insert(
                node_id.clone(),
                Node {
                    id: node_id.clone(),
                    state: NodeState::Reachable,
                    last_heartbeat_ms: unix_millis(),
                },
            );
        }

        info!(%node_id, "node registered");
        let _ = self.event_tx.send(ClusterEvent::NodeRegistered(node_id));
        true
    }

    /// Whether `node_id` is known and currently reachable.
    ///
    /// Unknown nodes are reported unreachable.
    pub fn is_reachable(&self, node_id: &NodeId) -> bool {
        self.nodes
            .read()
            .expect("lock poisoned")
            .get(node_id)
            .is_some_and(|n| n.state == NodeState::Reachable)
    }

    /// Recovery signal: mark a node reachable.
    ///
    /// Returns `true` if this was a transition.
    pub fn mark_reachable(&self, node_id: &NodeId) -> Result<bool, ClusterError> {
        self.transition(node_id, NodeState::Reachable, true)
    }

    /// Loss signal: mark a node unreachable.
    ///
    /// Returns `true` if this was a transition.
    pub fn mark_unreachable(&self, node_id: &NodeId) -> Result<bool, ClusterError> {
        self.transition(node_id, NodeState::Unreachable, false)
    }

    /// Record a heartbeat: stamps the node and marks it reachable.
    ///
    /// Unknown nodes are registered. Returns `true` if the node transitioned
    /// from unreachable to reachable.
    pub fn record_heartbeat(&self, node_id: &NodeId) -> bool {
        if self.register(node_id.clone()) {
            return false;
        }
        // Registered above if absent, so the lookup cannot miss.
        self.transition(node_id, NodeState::Reachable, true)
            .unwrap_or(false)
    }

    /// Mark every reachable node silent for longer than `timeout_ms` as
    /// unreachable. Returns the nodes that transitioned.
    pub fn expire_stale(&self, now_ms: u64, timeout_ms: u64) -> Vec<NodeId> {
        let mut expired = Vec::new();
        {
            let mut nodes = self.nodes.write().expect("lock poisoned");
            for (node_id, node) in nodes.iter_mut() {
                if node.state == NodeState::Reachable
                    && now_ms.saturating_sub(node.last_heartbeat_ms) >= timeout_ms
                {
                    node.state = NodeState::Unreachable;
                    expired.push(node_id.clone());
                }
            }
        }

        expired.sort();
        for node_id in &expired {
            info!(%node_id, "heartbeat timed out, node unreachable");
            let _ = self
                .event_tx
                .send(ClusterEvent::NodeUnreachable(node_id.clone()));
        }
        expired
    }

    /// Return a specific node.
    pub fn get(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.read().expect("lock poisoned").get(node_id).cloned()
    }

    /// Return a snapshot of all nodes, ordered by ID.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Return the IDs of all reachable nodes, ordered.
    pub fn reachable_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(|n| n.state == NodeState::Reachable)
            .map(|n| n.id)
            .collect()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().expect("lock poisoned").len()
    }

    /// Whether no node is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(
        &self,
        node_id: &NodeId,
        to: NodeState,
        stamp: bool,
    ) -> Result<bool, ClusterError> {
        {
            let mut nodes = self.nodes.write().expect("lock poisoned");
            let node = nodes
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::NodeNotFound(node_id.clone()))?;
            if stamp {
                node.last_heartbeat_ms = unix_millis();
            }
            if node.state == to {
                debug!(%node_id, state = ?to, "node already in requested state");
                return Ok(false);
            }
            node.state = to;
        }

        let event = match to {
            NodeState::Reachable => {
                info!(%node_id, "node reachable");
                ClusterEvent::NodeReachable(node_id.clone())
            }
            NodeState::Unreachable => {
                info!(%node_id, "node unreachable");
                ClusterEvent::NodeUnreachable(node_id.clone())
            }
        };
        let _ = self.event_tx.send(event);
        Ok(true)
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.len())
            .finish_non_exhaustive()
    }
}
