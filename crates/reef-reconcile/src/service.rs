//! Volume service: the boundary operations of the control plane.

use std::collections::BTreeMap;
use std::sync::Arc;

use reef_agent::{AgentDirectory, NexusManager, ReplicaManager};
use reef_cluster::NodeRegistry;
use reef_meta::{MetaStore, Transition};
use reef_types::{
    CleanupTask, Nexus, NexusId, NexusState, NodeId, PendingCleanup, Pool, PoolId, Protocol,
    ReconcileConfig, Replica, ReplicaId, ReplicaState, Volume, VolumeId, VolumeSpec, VolumeStatus,
    VolumeTarget, unix_millis,
};
use tracing::{debug, info, instrument, warn};

use crate::backoff::Backoff;
use crate::error::VolumeError;
use crate::locks::VolumeLocks;
use crate::reconciler::{DeleteOutcome, VolumeReconciler};
use crate::teardown::Teardown;

type Result<T> = std::result::Result<T, VolumeError>;

/// Entry point for every volume operation.
///
/// Mutating operations on the same volume id are serialised through
/// [`VolumeLocks`]; operations on distinct volumes run concurrently.
pub struct VolumeService {
    meta: Arc<MetaStore>,
    registry: Arc<NodeRegistry>,
    replicas: ReplicaManager,
    nexus: NexusManager,
    teardown: Teardown,
    locks: Arc<VolumeLocks>,
    reconciler: VolumeReconciler,
    config: ReconcileConfig,
}

impl VolumeService {
    /// Wire a service over the given store, registry and agents.
    pub fn new(
        meta: Arc<MetaStore>,
        registry: Arc<NodeRegistry>,
        agents: Arc<AgentDirectory>,
        config: ReconcileConfig,
    ) -> Arc<Self> {
        let timeout = config.operation_timeout();
        let replicas = ReplicaManager::new(registry.clone(), agents.clone(), timeout);
        let nexus = NexusManager::new(registry.clone(), agents, timeout);
        let teardown = Teardown::new(nexus.clone(), replicas.clone());
        let locks = VolumeLocks::new();
        let reconciler = VolumeReconciler::new(
            meta.clone(),
            teardown.clone(),
            locks.clone(),
            Backoff::from_config(&config),
        );
        Arc::new(Self {
            meta,
            registry,
            replicas,
            nexus,
            teardown,
            locks,
            reconciler,
            config,
        })
    }

    /// The metadata store.
    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    /// The node registry.
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// The step executor shared with the recovery path.
    pub fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    /// Active configuration.
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    // ----- Pools -----

    /// Create a pool on `node` and record it.
    ///
    /// Idempotent for an identical pool; `Conflict` if the id is already
    /// used on another node or with other disks.
    pub async fn put_node_pool(
        &self,
        node: &NodeId,
        pool_id: &PoolId,
        disks: Vec<String>,
    ) -> Result<Pool> {
        let pool = Pool {
            id: pool_id.clone(),
            node: node.clone(),
            disks,
        };
        if let Some(existing) = self.meta.get_pool(pool_id)? {
            if existing == pool {
                return Ok(existing);
            }
            return Err(VolumeError::conflict(
                format!("pool {pool_id}"),
                format!("pool already exists on node {}", existing.node),
            ));
        }

        self.replicas.create_pool(&pool).await?;
        self.meta.put_pool(&pool)?;
        info!(pool = %pool.id, %node, "pool created");
        Ok(pool)
    }

    // ----- Volumes -----

    /// Create a volume with `spec.replicas` replicas on distinct reachable
    /// nodes.
    #[instrument(skip(self, spec), fields(volume = %id, replicas = spec.replicas))]
    pub async fn put_volume(&self, id: &VolumeId, spec: VolumeSpec) -> Result<Volume> {
        if spec.replicas == 0 {
            return Err(VolumeError::InvalidArgument(
                "replica count must be at least 1".to_string(),
            ));
        }
        if spec.size == 0 {
            return Err(VolumeError::InvalidArgument(
                "size must be non-zero".to_string(),
            ));
        }

        let _guard = self.locks.lock(id).await;

        if let Some(existing) = self.meta.get_volume(id)? {
            return match existing.status {
                VolumeStatus::Created | VolumeStatus::Degraded if existing.spec == spec => {
                    Ok(existing)
                }
                VolumeStatus::Created | VolumeStatus::Degraded => Err(VolumeError::conflict(
                    id,
                    "volume exists with a different spec",
                )),
                status => Err(VolumeError::conflict(
                    id,
                    format!("volume is {status:?}"),
                )),
            };
        }

        let pools = self.select_pools(spec.replicas as usize)?;
        let incarnation: u64 = rand::random();
        let replicas: Vec<Replica> = pools
            .iter()
            .enumerate()
            .map(|(index, pool)| Replica {
                id: ReplicaId::for_volume(id, incarnation, index as u8),
                volume: id.clone(),
                pool: pool.id.clone(),
                node: pool.node.clone(),
                state: ReplicaState::Online,
            })
            .collect();
        let volume = Volume {
            id: id.clone(),
            spec,
            incarnation,
            target: None,
            status: VolumeStatus::Creating,
            replicas,
            nexus: None,
            created_at_ms: unix_millis(),
        };
        if !self.meta.insert_volume_if_absent(&volume)? {
            return Err(VolumeError::conflict(id, "concurrent create"));
        }

        for (created, replica) in volume.replicas.iter().enumerate() {
            if let Err(e) = self.replicas.create_replica(replica, spec.size).await {
                warn!(replica = %replica.id.short(), node = %replica.node, error = %e, "replica creation failed, rolling back");
                let mut partial = volume.clone();
                partial.replicas.truncate(created + 1);
                self.roll_back(partial).await?;
                return Err(e.into());
            }
        }

        match self
            .meta
            .transition_status(id, &[VolumeStatus::Creating], VolumeStatus::Created)?
        {
            Transition::Applied(created) => {
                info!("volume created");
                Ok(created)
            }
            Transition::Rejected(v) => Err(VolumeError::conflict(
                id,
                format!("volume became {:?} during creation", v.status),
            )),
            Transition::Missing => Err(VolumeError::NotFound(id.clone())),
        }
    }

    /// Pools on distinct reachable nodes, ordered by node id.
    fn select_pools(&self, needed: usize) -> Result<Vec<Pool>> {
        let mut by_node: BTreeMap<NodeId, Pool> = BTreeMap::new();
        for pool in self.meta.list_pools()? {
            if self.registry.is_reachable(&pool.node) {
                by_node.entry(pool.node.clone()).or_insert(pool);
            }
        }
        if by_node.len() < needed {
            return Err(VolumeError::InsufficientPools {
                needed,
                available: by_node.len(),
            });
        }
        Ok(by_node.into_values().take(needed).collect())
    }

    /// Tear down a half-created volume. Caller holds the volume lock.
    async fn roll_back(&self, mut partial: Volume) -> Result<()> {
        partial.status = VolumeStatus::Deleting;
        self.meta.put_volume(&partial)?;
        let report = self.reconciler.teardown_volume(&partial).await?;
        debug!(deferred = report.deferred.len(), "rolled back partial volume");
        Ok(())
    }

    /// Publish a volume: create its nexus on `node` and share it over `protocol`.
    ///
    /// Republishing with the same node and protocol returns the volume as is.
    #[instrument(skip(self), fields(volume = %id))]
    pub async fn put_volume_target(
        &self,
        id: &VolumeId,
        node: &NodeId,
        protocol: Protocol,
    ) -> Result<Volume> {
        let _guard = self.locks.lock(id).await;
        let volume = self
            .meta
            .get_volume(id)?
            .ok_or_else(|| VolumeError::NotFound(id.clone()))?;

        if !volume.status.is_deletable() {
            return Err(VolumeError::conflict(
                id,
                format!("cannot publish a volume in status {:?}", volume.status),
            ));
        }
        if let Some(target) = &volume.target {
            let shared = volume
                .nexus
                .as_ref()
                .is_some_and(|n| n.state == NexusState::Published);
            if !shared {
                return Err(VolumeError::conflict(
                    id,
                    "target is half unpublished, unpublish it again first",
                ));
            }
            if &target.node == node && target.protocol == protocol {
                return Ok(volume);
            }
            return Err(VolumeError::conflict(
                id,
                format!("already published on {} over {}", target.node, target.protocol),
            ));
        }
        if !self.registry.is_reachable(node) {
            return Err(VolumeError::NodeUnreachable(node.clone()));
        }

        let mut nexus = Nexus {
            id: NexusId::for_volume(id, volume.incarnation, node, rand::random()),
            volume: id.clone(),
            node: node.clone(),
            target: None,
            children: volume.replicas.iter().map(|r| r.id).collect(),
            state: NexusState::Unpublished,
        };
        let descriptor = match self.nexus.publish(&nexus, volume.spec.size, protocol).await {
            Ok(descriptor) => descriptor,
            Err(failure) => {
                if failure.nexus_left {
                    self.reconciler
                        .defer(CleanupTask::DestroyNexus(nexus.clone()), &failure.error)?;
                }
                return Err(failure.error.into());
            }
        };
        nexus.target = Some(descriptor);
        nexus.state = NexusState::Published;

        let target = VolumeTarget {
            node: node.clone(),
            protocol,
        };
        let recorded = nexus.clone();
        let updated = match self.meta.update_volume(id, |v| {
            v.target = Some(target);
            v.nexus = Some(recorded);
        }) {
            Ok(Some(updated)) => updated,
            result => {
                warn!(nexus = %nexus.id.short(), "failed to record published nexus, reclaiming it");
                self.reclaim_nexus(&nexus).await?;
                return Err(match result {
                    Err(e) => e.into(),
                    Ok(_) => VolumeError::NotFound(id.clone()),
                });
            }
        };
        info!(%node, %protocol, "volume published");
        Ok(updated)
    }

    /// Destroy a nexus no record refers to, or leave it in the ledger if
    /// the destroy fails.
    pub(crate) async fn reclaim_nexus(&self, nexus: &Nexus) -> Result<()> {
        if let Err(e) = self.nexus.destroy_nexus(nexus).await {
            self.reconciler
                .defer(CleanupTask::DestroyNexus(nexus.clone()), &e)?;
        }
        Ok(())
    }

    /// Unpublish a volume: unshare and destroy its nexus.
    ///
    /// Unlike delete, an unreachable nexus node fails this call with
    /// [`VolumeError::NodeUnreachable`] and leaves the volume published.
    /// A destroy that fails after the unshare leaves the nexus recorded as
    /// `Unpublished` with the target still set; calling this again finishes
    /// the job.
    #[instrument(skip(self), fields(volume = %id))]
    pub async fn del_volume_target(&self, id: &VolumeId) -> Result<Volume> {
        let _guard = self.locks.lock(id).await;
        let volume = self
            .meta
            .get_volume(id)?
            .ok_or_else(|| VolumeError::NotFound(id.clone()))?;

        if volume.status == VolumeStatus::Deleting {
            return Err(VolumeError::conflict(id, "volume is being deleted"));
        }
        let Some(nexus) = &volume.nexus else {
            return Ok(volume);
        };

        self.nexus.unpublish_target(nexus).await?;
        // The endpoint is gone even if the destroy below fails.
        self.meta.update_volume(id, |v| {
            if let Some(n) = &mut v.nexus {
                n.target = None;
                n.state = NexusState::Unpublished;
            }
        })?;
        self.nexus.destroy_nexus(nexus).await?;

        let updated = self
            .meta
            .update_volume(id, |v| {
                v.target = None;
                v.nexus = None;
            })?
            .ok_or_else(|| VolumeError::NotFound(id.clone()))?;
        info!("volume unpublished");
        Ok(updated)
    }

    /// Delete a volume. Never returns [`VolumeError::NodeUnreachable`].
    pub async fn delete_volume(&self, id: &VolumeId) -> Result<DeleteOutcome> {
        self.reconciler.delete(id).await
    }

    /// Current record of a volume.
    pub fn get_volume(&self, id: &VolumeId) -> Result<Volume> {
        self.meta
            .get_volume(id)?
            .ok_or_else(|| VolumeError::NotFound(id.clone()))
    }

    /// All volume records, ordered by id.
    pub fn list_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.meta.list_volumes()?)
    }

    /// All pools, ordered by id.
    pub fn list_pools(&self) -> Result<Vec<Pool>> {
        Ok(self.meta.list_pools()?)
    }

    /// The pending-cleanup ledger.
    pub fn pending_cleanups(&self) -> Result<Vec<PendingCleanup>> {
        Ok(self.meta.list_pending()?)
    }

    /// Finish operations interrupted by a restart.
    ///
    /// `Deleting` records are torn down; `Creating` records cannot have a
    /// live creator after a restart and are rolled back. Returns the number
    /// of volumes handled.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let mut resumed = 0;
        for volume in self.meta.list_volumes()? {
            match volume.status {
                VolumeStatus::Deleting => {
                    self.reconciler.delete(&volume.id).await?;
                    resumed += 1;
                }
                VolumeStatus::Creating => {
                    let _guard = self.locks.lock(&volume.id).await;
                    info!(volume = %volume.id, "rolling back interrupted create");
                    self.roll_back(volume).await?;
                    resumed += 1;
                }
                _ => {}
            }
        }
        if resumed > 0 {
            info!(resumed, "resumed interrupted volume operations");
        }
        Ok(resumed)
    }

    // ----- Health -----

    /// `Created → Degraded` for every volume with a replica on `node`.
    pub fn on_node_unreachable(&self, node: &NodeId) -> Result<usize> {
        let mut degraded = 0;
        for volume in self.meta.list_volumes()? {
            if !volume.replicas.iter().any(|r| &r.node == node) {
                continue;
            }
            if let Transition::Applied(_) = self.meta.transition_status(
                &volume.id,
                &[VolumeStatus::Created],
                VolumeStatus::Degraded,
            )? {
                info!(volume = %volume.id, %node, "volume degraded");
                degraded += 1;
            }
        }
        Ok(degraded)
    }

    /// `Degraded → Created` for volumes on `node` whose replica nodes are all
    /// reachable again.
    pub fn on_node_reachable(&self, node: &NodeId) -> Result<usize> {
        let mut healed = 0;
        for volume in self.meta.list_volumes()? {
            if volume.status != VolumeStatus::Degraded || !volume.touches_node(node) {
                continue;
            }
            if !volume
                .replica_nodes()
                .iter()
                .all(|n| self.registry.is_reachable(n))
            {
                continue;
            }
            if let Transition::Applied(_) = self.meta.transition_status(
                &volume.id,
                &[VolumeStatus::Degraded],
                VolumeStatus::Created,
            )? {
                info!(volume = %volume.id, %node, "volume healthy again");
                healed += 1;
            }
        }
        Ok(healed)
    }
}
