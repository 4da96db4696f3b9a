//! Per-node storage agents and the managers that drive them.
//!
//! This crate defines the [`NodeAgent`] trait for the storage agent running
//! on each node, along with:
//!
//! - [`MemoryAgent`]: in-memory agent with outage and failure injection.
//! - [`SlowAgent`]: latency-injecting wrapper for chaos tests.
//! - [`AgentDirectory`]: node → agent lookup.
//! - [`ReplicaManager`] and [`NexusManager`]: reachability-gated,
//!   timeout-bounded operations on replicas, pools, and nexuses.

mod directory;
mod error;
mod memory_agent;
mod nexus;
mod replica;
mod slow_agent;
mod traits;

pub use directory::AgentDirectory;
pub use error::{AgentError, ManagerError};
pub use memory_agent::MemoryAgent;
pub use nexus::{NexusManager, PublishError};
pub use replica::ReplicaManager;
pub use slow_agent::SlowAgent;
pub use traits::{Inventory, NodeAgent};
