//! Node reachability tracking.
//!
//! This crate provides:
//!
//! - [`NodeRegistry`]: the `Reachable ⇄ Unreachable` state machine for
//!   every storage node, with a broadcast channel of [`ClusterEvent`]s.
//! - [`liveness`]: a heartbeat-timeout sweeper feeding the registry.
//!
//! [`ClusterEvent`]: reef_types::ClusterEvent

mod error;
pub mod liveness;
mod registry;


pub use error::ClusterError;
pub use liveness::LivenessHandle;
pub use registry::NodeRegistry;
