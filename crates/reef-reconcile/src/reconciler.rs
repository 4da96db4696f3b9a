//! The deletion protocol.
//!
//! A delete moves a volume `Created|Degraded → Deleting`, attempts every
//! teardown step, records the steps that could not complete in the
//! pending-cleanup ledger, and then removes the record. Node unreachability
//! never fails a delete: it only produces ledger entries.

use std::collections::HashMap;
use std::sync::Arc;

use reef_agent::{AgentError, ManagerError};
use reef_meta::{MetaStore, Transition};
use reef_types::{
    CleanupTask, NexusState, ObjectRef, PendingKey, ReplicaState, Volume, VolumeId, VolumeStatus,
    unix_millis,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::error::VolumeError;
use crate::locks::VolumeLocks;
use crate::teardown::{self, Teardown};

/// Result of a delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record was removed.
    Deleted(DeleteReport),
    /// No record existed; nothing was done.
    NotFound,
}

/// What a completed delete did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Objects destroyed during the call.
    pub destroyed: Vec<ObjectRef>,
    /// Steps left in the pending-cleanup ledger.
    pub deferred: Vec<PendingKey>,
}

/// Drives volume deletion.
pub struct VolumeReconciler {
    meta: Arc<MetaStore>,
    teardown: Teardown,
    locks: Arc<VolumeLocks>,
    backoff: Backoff,
}

impl VolumeReconciler {
    /// Create a reconciler.
    pub fn new(
        meta: Arc<MetaStore>,
        teardown: Teardown,
        locks: Arc<VolumeLocks>,
        backoff: Backoff,
    ) -> Self {
        Self {
            meta,
            teardown,
            locks,
            backoff,
        }
    }

    /// Delete a volume.
    ///
    /// Serialised per id. Returns [`DeleteOutcome::NotFound`] for an absent
    /// volume, [`VolumeError::Conflict`] for a volume still being created,
    /// and resumes an interrupted teardown for a volume already `Deleting`.
    #[instrument(skip(self), fields(volume = %id))]
    pub async fn delete(&self, id: &VolumeId) -> Result<DeleteOutcome, VolumeError> {
        let _guard = self.locks.lock(id).await;
        self.delete_locked(id).await
    }

    /// [`Self::delete`] for callers already holding the volume lock.
    pub(crate) async fn delete_locked(&self, id: &VolumeId) -> Result<DeleteOutcome, VolumeError> {
        let volume = match self.meta.transition_status(
            id,
            VolumeStatus::DELETABLE,
            VolumeStatus::Deleting,
        )? {
            Transition::Missing => {
                debug!("volume absent");
                return Ok(DeleteOutcome::NotFound);
            }
            Transition::Applied(volume) => {
                info!(replicas = volume.replicas.len(), published = volume.is_published(), "volume deleting");
                volume
            }
            Transition::Rejected(volume) => match volume.status {
                VolumeStatus::Deleting => {
                    info!("resuming interrupted delete");
                    volume
                }
                VolumeStatus::Deleted => {
                    self.meta.remove_volume(id)?;
                    return Ok(DeleteOutcome::NotFound);
                }
                status => {
                    return Err(VolumeError::conflict(
                        id,
                        format!("cannot delete a volume in status {status:?}"),
                    ));
                }
            },
        };

        let report = self.teardown_volume(&volume).await?;
        Ok(DeleteOutcome::Deleted(report))
    }

    /// Attempt every teardown step of a `Deleting` volume, persist the
    /// deferred ones, and remove the record.
    pub(crate) async fn teardown_volume(&self, volume: &Volume) -> Result<DeleteReport, VolumeError> {
        let now = unix_millis();
        let mut destroyed = Vec::new();
        let mut deferred = Vec::new();

        self.meta.update_volume(&volume.id, |v| {
            for replica in &mut v.replicas {
                replica.state = ReplicaState::Destroying;
            }
            if let Some(nexus) = &mut v.nexus {
                nexus.state = NexusState::Destroying;
            }
        })?;

        let (nexus_steps, replica_steps): (Vec<_>, Vec<_>) = teardown::plan(volume)
            .into_iter()
            .partition(|t| !matches!(t, CleanupTask::DestroyReplica(_)));

        // Nexus steps run in order. A failed unpublish does not stop the
        // destroy, which unpublishes on its own; only the destroy outcome
        // decides whether the nexus needs a ledger entry.
        for task in nexus_steps {
            let is_destroy = matches!(task, CleanupTask::DestroyNexus(_));
            match self.teardown.run(&task).await {
                Ok(()) if is_destroy => destroyed.push(task),
                Ok(()) => {}
                Err(e) if is_destroy => {
                    log_deferred(&task, &e);
                    deferred.push(teardown::deferred_entry(task, &e, &self.backoff, now));
                }
                Err(e) => {
                    debug!(task = task.kind(), error = %e, "unpublish failed, continuing with destroy");
                }
            }
        }

        // Replicas are independent of each other.
        let mut set = JoinSet::new();
        let mut spawned = HashMap::new();
        for task in replica_steps {
            let runner = self.teardown.clone();
            let step = task.clone();
            let handle = set.spawn(async move { runner.run(&step).await });
            spawned.insert(handle.id(), task);
        }
        while let Some(joined) = set.join_next_with_id().await {
            let (task_id, result) = match joined {
                Ok((task_id, result)) => (task_id, result),
                Err(join_err) => {
                    error!(error = %join_err, "replica teardown task aborted");
                    let task_id = join_err.id();
                    let Some(task) = spawned.remove(&task_id) else {
                        continue;
                    };
                    let e = ManagerError::Agent {
                        node: task.node().clone(),
                        source: AgentError::Internal(join_err.to_string()),
                    };
                    deferred.push(teardown::deferred_entry(task, &e, &self.backoff, now));
                    continue;
                }
            };
            let Some(task) = spawned.remove(&task_id) else {
                continue;
            };
            match result {
                Ok(()) => destroyed.push(task),
                Err(e) => {
                    log_deferred(&task, &e);
                    deferred.push(teardown::deferred_entry(task, &e, &self.backoff, now));
                }
            }
        }

        // Ledger first, then the record: a crash in between leaves a
        // `Deleting` record whose resumed teardown is idempotent.
        let mut report = DeleteReport::default();
        for entry in &deferred {
            self.meta.put_pending(entry)?;
            report.deferred.push(entry.key());
        }
        for task in &destroyed {
            // Clears entries left behind by an interrupted earlier attempt.
            self.meta.remove_pending(&task.key())?;
            report.destroyed.push(task.object());
        }
        self.meta.remove_volume(&volume.id)?;

        info!(
            destroyed = report.destroyed.len(),
            deferred = report.deferred.len(),
            "volume deleted"
        );
        Ok(report)
    }

    /// Record a step that could not complete outside of a delete.
    pub(crate) fn defer(
        &self,
        task: CleanupTask,
        error: &ManagerError,
    ) -> Result<PendingKey, VolumeError> {
        log_deferred(&task, error);
        let entry = teardown::deferred_entry(task, error, &self.backoff, unix_millis());
        self.meta.put_pending(&entry)?;
        Ok(entry.key())
    }
}

fn log_deferred(task: &CleanupTask, e: &ManagerError) {
    if e.is_unreachable() {
        info!(task = task.kind(), node = %task.node(), "node unreachable, step deferred");
    } else {
        warn!(task = task.kind(), node = %task.node(), error = %e, "step failed, deferred with backoff");
    }
}
