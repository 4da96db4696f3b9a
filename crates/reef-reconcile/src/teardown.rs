//! Single teardown steps, shared by the delete path and the recovery path.

use reef_agent::{ManagerError, NexusManager, ReplicaManager};
use reef_types::{CleanupTask, PendingCleanup, Volume};

use crate::backoff::Backoff;

/// Executes [`CleanupTask`]s against the managers.
#[derive(Clone)]
pub struct Teardown {
    nexus: NexusManager,
    replicas: ReplicaManager,
}

impl Teardown {
    /// Create a teardown executor.
    pub fn new(nexus: NexusManager, replicas: ReplicaManager) -> Self {
        Self { nexus, replicas }
    }

    /// Run one step. Every step is idempotent.
    pub async fn run(&self, task: &CleanupTask) -> Result<(), ManagerError> {
        match task {
            CleanupTask::UnpublishTarget(nexus) => self.nexus.unpublish_target(nexus).await,
            CleanupTask::DestroyNexus(nexus) => self.nexus.destroy_nexus(nexus).await,
            CleanupTask::DestroyReplica(replica) => self.replicas.destroy_replica(replica).await,
        }
    }
}

/// Ordered teardown steps for a volume: unpublish (if published), destroy
/// nexus (if any), then one destroy per replica.
pub fn plan(volume: &Volume) -> Vec<CleanupTask> {
    let mut tasks = Vec::with_capacity(volume.replicas.len() + 2);
    if let Some(nexus) = &volume.nexus {
        if volume.target.is_some() || nexus.target.is_some() {
            tasks.push(CleanupTask::UnpublishTarget(nexus.clone()));
        }
        tasks.push(CleanupTask::DestroyNexus(nexus.clone()));
    }
    for replica in &volume.replicas {
        tasks.push(CleanupTask::DestroyReplica(replica.clone()));
    }
    tasks
}

/// Ledger entry for a step that could not complete.
///
/// Reachability failures are due immediately (their node's recovery event
/// drives them); other failures count as an attempt and are backed off.
pub(crate) fn deferred_entry(
    task: CleanupTask,
    error: &ManagerError,
    backoff: &Backoff,
    now_ms: u64,
) -> PendingCleanup {
    let mut entry = PendingCleanup::new(task, now_ms);
    entry.last_error = Some(error.to_string());
    if !error.is_unreachable() {
        entry.attempts = 1;
        entry.next_attempt_ms = now_ms + backoff.delay_ms(1);
    }
    entry
}
