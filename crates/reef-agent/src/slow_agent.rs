//! A [`NodeAgent`] wrapper that adds configurable random call latency.
//!
//! `SlowAgent` wraps any `Arc<dyn NodeAgent>` and sleeps for a random
//! duration before each call. The RNG is seeded for deterministic,
//! reproducible behaviour across test runs. A latency above the managers'
//! operation timeout turns the node into a hung node.
//!
//! # Example
//!
//! ```ignore
//! let slow = SlowAgent::new(inner)
//!     .latency(5, 20) // 5–20 ms per call
//!     .seed(42);
//! ```

use std::sync::{Arc, Mutex};

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use reef_types::{Nexus, NexusId, NodeId, Pool, Protocol, Replica, ReplicaId};

use crate::error::AgentError;
use crate::traits::{Inventory, NodeAgent};

/// A [`NodeAgent`] wrapper that injects random latency before each call.
///
/// Useful for chaos testing: exposes ordering assumptions that an instant
/// in-memory agent hides.
pub struct SlowAgent {
    inner: Arc<dyn NodeAgent>,
    latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
}

impl SlowAgent {
    /// Wrap an existing agent with zero latency (pass-through) by default.
    pub fn new(inner: Arc<dyn NodeAgent>) -> Self {
        Self {
            inner,
            latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Set the latency range in milliseconds (uniform random).
    pub fn latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Sleep for a random duration in `[min, max]` milliseconds.
    async fn delay(&self) {
        let (min, max) = self.latency_ms;

        if max == 0 {
            return;
        }

        let ms = if min >= max {
            max
        } else {
            self.rng
                .lock()
                .expect("lock poisoned")
                .random_range(min..=max)
        };

        if ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait::async_trait]
impl NodeAgent for SlowAgent {
    fn node_id(&self) -> &NodeId {
        self.inner.node_id()
    }

    async fn create_pool(&self, pool: &Pool) -> Result<(), AgentError> {
        self.delay().await;
        self.inner.create_pool(pool).await
    }

    async fn create_replica(&self, replica: &Replica, size: u64) -> Result<(), AgentError> {
        self.delay().await;
        self.inner.create_replica(replica, size).await
    }

    async fn destroy_replica(&self, id: &ReplicaId) -> Result<(), AgentError> {
        self.delay().await;
        self.inner.destroy_replica(id).await
    }

    async fn create_nexus(&self, nexus: &Nexus, size: u64) -> Result<(), AgentError> {
        self.delay().await;
        self.inner.create_nexus(nexus, size).await
    }

    async fn share_nexus(&self, id: &NexusId, protocol: Protocol) -> Result<String, AgentError> {
        self.delay().await;
        self.inner.share_nexus(id, protocol).await
    }

    async fn unshare_nexus(&self, id: &NexusId) -> Result<(), AgentError> {
        self.delay().await;
        self.inner.unshare_nexus(id).await
    }

    async fn destroy_nexus(&self, id: &NexusId) -> Result<(), AgentError> {
        self.delay().await;
        self.inner.destroy_nexus(id).await
    }

    async fn inventory(&self) -> Result<Inventory, AgentError> {
        self.inner.inventory().await
    }
}
