//! Shared types and identifiers for Reef.
//!
//! This crate defines all core types used across the Reef workspace:
//! identifiers ([`VolumeId`], [`NodeId`], [`PoolId`], [`ReplicaId`], [`NexusId`]),
//! the volume model ([`Volume`], [`Replica`], [`Nexus`]),
//! cluster types ([`Node`], [`NodeState`], [`ClusterEvent`]),
//! the deferred teardown ledger ([`PendingCleanup`], [`CleanupTask`]),
//! and configuration ([`ReconcileConfig`], [`LivenessConfig`]).

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Derive an ID by hashing the given parts with BLAKE3.
            ///
            /// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]`
            /// never collide.
            pub fn derive(parts: &[&[u8]]) -> Self {
                let mut hasher = blake3::Hasher::new();
                for part in parts {
                    hasher.update(&(part.len() as u64).to_le_bytes());
                    hasher.update(part);
                }
                Self(hasher.finalize().into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// First 8 hex characters, for log lines and endpoints.
            pub fn short(&self) -> String {
                self.to_string()[..8].to_string()
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }
    };
}

macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from any string-like value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_name!(
    /// User-assigned volume identifier (typically a UUID string).
    VolumeId
);

define_name!(
    /// Name of a cluster node hosting pools, replicas, and nexuses.
    NodeId
);

define_name!(
    /// User-assigned storage pool identifier.
    PoolId
);

define_id!(
    /// Identifier for a replica: `blake3(volume, incarnation, index)`.
    ReplicaId
);

define_id!(
    /// Identifier for a nexus: `blake3(volume, incarnation, node, publication)`.
    NexusId
);

impl ReplicaId {
    /// Derive the ID of the `index`-th replica of a volume incarnation.
    pub fn for_volume(volume: &VolumeId, incarnation: u64, index: u8) -> Self {
        Self::derive(&[
            b"replica",
            volume.as_ref(),
            &incarnation.to_le_bytes(),
            &[index],
        ])
    }
}

impl NexusId {
    /// Derive the ID of the nexus a volume incarnation publishes on `node`.
    ///
    /// `publication` distinguishes successive publishes of the same
    /// incarnation, so a stale cleanup entry never names a live nexus.
    pub fn for_volume(
        volume: &VolumeId,
        incarnation: u64,
        node: &NodeId,
        publication: u64,
    ) -> Self {
        Self::derive(&[
            b"nexus",
            volume.as_ref(),
            &incarnation.to_le_bytes(),
            node.as_ref(),
            &publication.to_le_bytes(),
        ])
    }
}

// ---------------------------------------------------------------------------
// Volume model
// ---------------------------------------------------------------------------

/// Block protocol a nexus can be shared over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// NVMe over Fabrics.
    Nvmf,
    /// iSCSI.
    Iscsi,
    /// Network block device.
    Nbd,
}

impl Protocol {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvmf => "nvmf",
            Self::Iscsi => "iscsi",
            Self::Nbd => "nbd",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known [`Protocol`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol: {0}")]
pub struct ParseProtocolError(pub String);

impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvmf" => Ok(Self::Nvmf),
            "iscsi" => Ok(Self::Iscsi),
            "nbd" => Ok(Self::Nbd),
            other => Err(ParseProtocolError(other.to_string())),
        }
    }
}

/// Volume policy knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePolicy {
    /// Whether the volume should self-heal after degradation.
    pub self_heal: bool,
}

/// Desired shape of a volume, as supplied by `put_volume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Size in bytes.
    pub size: u64,
    /// Desired number of replicas.
    pub replicas: u8,
    /// Volume policy.
    pub policy: VolumePolicy,
}

/// Lifecycle status of a volume record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeStatus {
    /// Replicas are being provisioned.
    Creating,
    /// All replicas are on reachable nodes.
    Created,
    /// At least one replica lives on an unreachable node.
    Degraded,
    /// A delete was accepted. Never reverts.
    Deleting,
    /// Terminal; the record is removed from the store.
    Deleted,
}

impl VolumeStatus {
    /// Statuses from which a delete may be accepted.
    pub const DELETABLE: &'static [VolumeStatus] = &[VolumeStatus::Created, VolumeStatus::Degraded];

    /// Whether a delete may transition this status to [`VolumeStatus::Deleting`].
    pub fn is_deletable(&self) -> bool {
        Self::DELETABLE.contains(self)
    }
}

/// Where and how a volume is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTarget {
    /// Node hosting the nexus.
    pub node: NodeId,
    /// Protocol the nexus is shared over.
    pub protocol: Protocol,
}

/// Lifecycle of a replica object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Present on its pool.
    Online,
    /// Teardown in progress.
    Destroying,
    /// Destroyed.
    Gone,
}

/// A single copy of volume data in a pool on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Replica identifier.
    pub id: ReplicaId,
    /// Owning volume.
    pub volume: VolumeId,
    /// Pool the replica is carved from.
    pub pool: PoolId,
    /// Node hosting the pool.
    pub node: NodeId,
    /// Current state.
    pub state: ReplicaState,
}

/// Lifecycle of a nexus object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NexusState {
    /// Shared over a protocol endpoint.
    Published,
    /// Present but not shared.
    Unpublished,
    /// Teardown in progress.
    Destroying,
    /// Destroyed.
    Gone,
}

/// Protocol endpoint a nexus is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Sharing protocol.
    pub protocol: Protocol,
    /// Endpoint URI, e.g. `nvmf://node-1/5f2c91ab`.
    pub endpoint: String,
}

/// Aggregation object exposing a volume's replicas as one block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nexus {
    /// Nexus identifier.
    pub id: NexusId,
    /// Owning volume.
    pub volume: VolumeId,
    /// Node hosting the nexus.
    pub node: NodeId,
    /// Shared endpoint, if published.
    pub target: Option<TargetDescriptor>,
    /// Replicas aggregated by this nexus.
    pub children: Vec<ReplicaId>,
    /// Current state.
    pub state: NexusState,
}

/// A volume record as held by the volume store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume identifier.
    pub id: VolumeId,
    /// Desired spec.
    pub spec: VolumeSpec,
    /// Random per-creation value feeding replica and nexus ID derivation.
    pub incarnation: u64,
    /// Publication target; present iff `nexus` is present.
    pub target: Option<VolumeTarget>,
    /// Observed status.
    pub status: VolumeStatus,
    /// Replica set.
    pub replicas: Vec<Replica>,
    /// Nexus, if published.
    pub nexus: Option<Nexus>,
    /// Unix timestamp (milliseconds) of creation.
    pub created_at_ms: u64,
}

impl Volume {
    /// Whether the volume currently has a publication target.
    pub fn is_published(&self) -> bool {
        self.target.is_some()
    }

    /// `target` present ⇔ nexus present.
    pub fn target_matches_nexus(&self) -> bool {
        self.target.is_some() == self.nexus.is_some()
    }

    /// Nodes hosting this volume's replicas, deduplicated, in replica order.
    pub fn replica_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::with_capacity(self.replicas.len());
        for replica in &self.replicas {
            if !nodes.contains(&replica.node) {
                nodes.push(replica.node.clone());
            }
        }
        nodes
    }

    /// Whether any replica or the nexus lives on `node`.
    pub fn touches_node(&self, node: &NodeId) -> bool {
        self.replicas.iter().any(|r| &r.node == node)
            || self.nexus.as_ref().is_some_and(|n| &n.node == node)
    }
}

/// A storage pool on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Pool identifier.
    pub id: PoolId,
    /// Owning node.
    pub node: NodeId,
    /// Backing disk URIs (e.g. `malloc:///disk?size_mb=50`).
    pub disks: Vec<String>,
}

// ---------------------------------------------------------------------------
// Cluster types
// ---------------------------------------------------------------------------

/// Reachability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Node answers heartbeats.
    Reachable,
    /// Heartbeat timed out or the node was reported lost.
    Unreachable,
}

/// A cluster node as tracked by the node registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier.
    pub id: NodeId,
    /// Current reachability.
    pub state: NodeState,
    /// Unix timestamp (milliseconds) of the last heartbeat or recovery signal.
    pub last_heartbeat_ms: u64,
}

/// Node reachability events broadcast by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A node was added to the registry.
    NodeRegistered(NodeId),
    /// A node transitioned to [`NodeState::Reachable`].
    NodeReachable(NodeId),
    /// A node transitioned to [`NodeState::Unreachable`].
    NodeUnreachable(NodeId),
}

// ---------------------------------------------------------------------------
// Pending cleanup ledger
// ---------------------------------------------------------------------------

/// Object a teardown task acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectRef {
    /// A nexus (and its target).
    Nexus(NexusId),
    /// A replica.
    Replica(ReplicaId),
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nexus(id) => write!(f, "nexus-{id}"),
            Self::Replica(id) => write!(f, "replica-{id}"),
        }
    }
}

/// A single teardown step against one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupTask {
    /// Remove the nexus's protocol endpoint.
    UnpublishTarget(Nexus),
    /// Remove the nexus (unpublishing it first if still shared).
    DestroyNexus(Nexus),
    /// Remove a replica from its pool.
    DestroyReplica(Replica),
}

impl CleanupTask {
    /// Node the task must run against.
    pub fn node(&self) -> &NodeId {
        match self {
            Self::UnpublishTarget(n) | Self::DestroyNexus(n) => &n.node,
            Self::DestroyReplica(r) => &r.node,
        }
    }

    /// Volume the object belonged to.
    pub fn volume(&self) -> &VolumeId {
        match self {
            Self::UnpublishTarget(n) | Self::DestroyNexus(n) => &n.volume,
            Self::DestroyReplica(r) => &r.volume,
        }
    }

    /// Object the task acts on.
    pub fn object(&self) -> ObjectRef {
        match self {
            Self::UnpublishTarget(n) | Self::DestroyNexus(n) => ObjectRef::Nexus(n.id),
            Self::DestroyReplica(r) => ObjectRef::Replica(r.id),
        }
    }

    /// Ledger key of the task.
    pub fn key(&self) -> PendingKey {
        PendingKey {
            node: self.node().clone(),
            volume: self.volume().clone(),
            object: self.object(),
        }
    }

    /// Replay order within a node: targets, then nexuses, then replicas.
    pub fn rank(&self) -> u8 {
        match self {
            Self::UnpublishTarget(_) => 0,
            Self::DestroyNexus(_) => 1,
            Self::DestroyReplica(_) => 2,
        }
    }

    /// Short task name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnpublishTarget(_) => "unpublish_target",
            Self::DestroyNexus(_) => "destroy_nexus",
            Self::DestroyReplica(_) => "destroy_replica",
        }
    }
}

/// Ledger key: `(node, volume, object)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingKey {
    /// Node owning the object.
    pub node: NodeId,
    /// Volume the object belonged to.
    pub volume: VolumeId,
    /// The object.
    pub object: ObjectRef,
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.volume, self.object)
    }
}

/// A deferred teardown step, replayed when its node is reachable again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCleanup {
    /// The deferred step.
    pub task: CleanupTask,
    /// Replay attempts that failed with a non-reachability error.
    pub attempts: u32,
    /// Replays that timed out while the registry still listed the node as
    /// reachable.
    pub timeouts: u32,
    /// Earliest unix time (milliseconds) at which a timed retry may run.
    pub next_attempt_ms: u64,
    /// Most recent failure, for operators.
    pub last_error: Option<String>,
    /// Unix time (milliseconds) the entry was first recorded.
    pub created_at_ms: u64,
}

impl PendingCleanup {
    /// New entry, due immediately.
    pub fn new(task: CleanupTask, now_ms: u64) -> Self {
        Self {
            task,
            attempts: 0,
            timeouts: 0,
            next_attempt_ms: now_ms,
            last_error: None,
            created_at_ms: now_ms,
        }
    }

    /// Ledger key of this entry.
    pub fn key(&self) -> PendingKey {
        self.task.key()
    }

    /// Whether a timed retry may run at `now_ms`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_ms <= now_ms
    }
}

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning for teardown and the recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// First retry delay after a non-reachability failure.
    pub retry_base_ms: u64,
    /// Upper bound on the retry delay.
    pub retry_max_ms: u64,
    /// Interval between ledger sweeps.
    pub sweep_interval_ms: u64,
    /// Bound on a single agent call; exceeding it counts as unreachable.
    pub operation_timeout_ms: u64,
    /// Concurrent replays during a sweep.
    pub max_concurrent_cleanups: u16,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 500,
            retry_max_ms: 60_000,
            sweep_interval_ms: 1_000,
            operation_timeout_ms: 5_000,
            max_concurrent_cleanups: 8,
        }
    }
}

impl ReconcileConfig {
    /// Config with short timings for tests.
    pub fn test_config() -> Self {
        Self {
            retry_base_ms: 1,
            retry_max_ms: 20,
            sweep_interval_ms: 10,
            operation_timeout_ms: 200,
            max_concurrent_cleanups: 4,
        }
    }

    /// [`Self::operation_timeout_ms`] as a [`Duration`].
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// [`Self::sweep_interval_ms`] as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Heartbeat-based liveness tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Silence after which a node is marked unreachable.
    pub heartbeat_timeout_ms: u64,
    /// How often heartbeat ages are checked.
    pub check_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 10_000,
            check_interval_ms: 1_000,
        }
    }
}

impl LivenessConfig {
    /// Config with short timings for tests.
    pub fn test_config() -> Self {
        Self {
            heartbeat_timeout_ms: 100,
            check_interval_ms: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
