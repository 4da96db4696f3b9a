//! In-memory storage agent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use reef_types::{Nexus, NexusId, NodeId, Pool, PoolId, Protocol, Replica, ReplicaId};
use tracing::debug;

use crate::error::AgentError;
use crate::traits::{Inventory, NodeAgent};

#[derive(Debug, Clone)]
struct NexusEntry {
    endpoint: Option<String>,
    protocol: Option<Protocol>,
}

#[derive(Debug, Default)]
struct AgentState {
    pools: HashMap<PoolId, Pool>,
    replicas: HashMap<ReplicaId, PoolId>,
    nexuses: HashMap<NexusId, NexusEntry>,
}

/// In-memory agent backed by a `Mutex<HashMap>` per object kind.
///
/// Used by tests and by `reefd --memory`. The agent can be taken offline
/// (every call then fails with [`AgentError::Unavailable`]) and can be told
/// to fail the next N mutating calls with [`AgentError::Internal`].
pub struct MemoryAgent {
    node_id: NodeId,
    state: Mutex<AgentState>,
    online: AtomicBool,
    fail_next: AtomicU32,
    fail_skip: AtomicU32,
    nexus_calls: AtomicU64,
}

impl MemoryAgent {
    /// Create an empty, online agent for `node_id`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: Mutex::new(AgentState::default()),
            online: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            fail_skip: AtomicU32::new(0),
            nexus_calls: AtomicU64::new(0),
        }
    }

    /// Take the agent offline or bring it back. Held objects are kept.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Whether the agent currently answers calls.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Fail the next `n` mutating calls with [`AgentError::Internal`].
    pub fn fail_next(&self, n: u32) {
        self.fail_after(0, n);
    }

    /// Let `skip` mutating calls through, then fail the following `n`.
    pub fn fail_after(&self, skip: u32, n: u32) {
        self.fail_skip.store(skip, Ordering::SeqCst);
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of nexus operations (create, share, unshare, destroy) received.
    pub fn nexus_calls(&self) -> u64 {
        self.nexus_calls.load(Ordering::SeqCst)
    }

    /// Whether the agent holds the replica.
    pub fn has_replica(&self, id: &ReplicaId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .replicas
            .contains_key(id)
    }

    /// Whether the agent holds the nexus.
    pub fn has_nexus(&self, id: &NexusId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .nexuses
            .contains_key(id)
    }

    /// Whether the nexus is currently shared.
    pub fn is_shared(&self, id: &NexusId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .nexuses
            .get(id)
            .is_some_and(|n| n.endpoint.is_some())
    }

    /// Number of replicas held.
    pub fn replica_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").replicas.len()
    }

    fn check_online(&self) -> Result<(), AgentError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(AgentError::Unavailable(self.node_id.clone()))
        }
    }

    /// Online check plus injected failure for mutating calls.
    fn check_mutation(&self) -> Result<(), AgentError> {
        self.check_online()?;
        if self.fail_next.load(Ordering::SeqCst) > 0
            && self
                .fail_skip
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(());
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AgentError::Internal("injected failure".to_string()));
        }
        Ok(())
    }

    fn count_nexus_call(&self) {
        self.nexus_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl NodeAgent for MemoryAgent {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn create_pool(&self, pool: &Pool) -> Result<(), AgentError> {
        self.check_mutation()?;
        let mut state = self.state.lock().expect("lock poisoned");
        match state.pools.get(&pool.id) {
            Some(existing) if existing == pool => Ok(()),
            Some(_) => Err(AgentError::PoolMismatch(pool.id.clone())),
            None => {
                debug!(node = %self.node_id, pool = %pool.id, "created pool");
                state.pools.insert(pool.id.clone(), pool.clone());
                Ok(())
            }
        }
    }

    async fn create_replica(&self, replica: &Replica, size: u64) -> Result<(), AgentError> {
        self.check_mutation()?;
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.pools.contains_key(&replica.pool) {
            return Err(AgentError::PoolNotFound(replica.pool.clone()));
        }
        state.replicas.insert(replica.id, replica.pool.clone());
        debug!(node = %self.node_id, replica = %replica.id, size, "created replica");
        Ok(())
    }

    async fn destroy_replica(&self, id: &ReplicaId) -> Result<(), AgentError> {
        self.check_mutation()?;
        let removed = self
            .state
            .lock()
            .expect("lock poisoned")
            .replicas
            .remove(id)
            .is_some();
        debug!(node = %self.node_id, replica = %id, removed, "destroyed replica");
        Ok(())
    }

    async fn create_nexus(&self, nexus: &Nexus, size: u64) -> Result<(), AgentError> {
        self.count_nexus_call();
        self.check_mutation()?;
        // Children live on other nodes and are reached over the fabric, so
        // they are not validated here.
        let mut state = self.state.lock().expect("lock poisoned");
        state.nexuses.entry(nexus.id).or_insert(NexusEntry {
            endpoint: None,
            protocol: None,
        });
        debug!(node = %self.node_id, nexus = %nexus.id, size, "created nexus");
        Ok(())
    }

    async fn share_nexus(&self, id: &NexusId, protocol: Protocol) -> Result<String, AgentError> {
        self.count_nexus_call();
        self.check_mutation()?;
        let mut state = self.state.lock().expect("lock poisoned");
        let entry = state
            .nexuses
            .get_mut(id)
            .ok_or(AgentError::NexusNotFound(*id))?;
        match (&entry.endpoint, entry.protocol) {
            (Some(endpoint), Some(existing)) if existing == protocol => Ok(endpoint.clone()),
            (Some(_), _) => Err(AgentError::AlreadyShared(*id)),
            (None, _) => {
                let endpoint = format!("{protocol}://{}/{id}", self.node_id);
                entry.endpoint = Some(endpoint.clone());
                entry.protocol = Some(protocol);
                debug!(node = %self.node_id, nexus = %id, %endpoint, "shared nexus");
                Ok(endpoint)
            }
        }
    }

    async fn unshare_nexus(&self, id: &NexusId) -> Result<(), AgentError> {
        self.count_nexus_call();
        self.check_mutation()?;
        if let Some(entry) = self.state.lock().expect("lock poisoned").nexuses.get_mut(id) {
            entry.endpoint = None;
            entry.protocol = None;
        }
        debug!(node = %self.node_id, nexus = %id, "unshared nexus");
        Ok(())
    }

    async fn destroy_nexus(&self, id: &NexusId) -> Result<(), AgentError> {
        self.count_nexus_call();
        self.check_mutation()?;
        let removed = self
            .state
            .lock()
            .expect("lock poisoned")
            .nexuses
            .remove(id)
            .is_some();
        debug!(node = %self.node_id, nexus = %id, removed, "destroyed nexus");
        Ok(())
    }

    async fn inventory(&self) -> Result<Inventory, AgentError> {
        self.check_online()?;
        let state = self.state.lock().expect("lock poisoned");
        let mut inventory = Inventory {
            pools: state.pools.keys().cloned().collect(),
            replicas: state.replicas.keys().copied().collect(),
            nexuses: state
                .nexuses
                .iter()
                .map(|(id, e)| (*id, e.endpoint.clone()))
                .collect(),
        };
        inventory.pools.sort();
        inventory.replicas.sort();
        inventory.nexuses.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(inventory)
    }
}
