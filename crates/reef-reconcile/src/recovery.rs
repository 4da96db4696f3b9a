//! Recovery worker: drains the pending-cleanup ledger.
//!
//! [`RecoveryWorker`] subscribes to [`ClusterEvent`]s and:
//! - On `NodeReachable` / `NodeRegistered`: replays every ledger entry for
//!   that node right away, ignoring backoff, then heals degraded volumes.
//! - On `NodeUnreachable`: marks volumes with a replica there `Degraded`.
//! - Periodically: replays entries whose node is reachable and whose
//!   backoff has elapsed.
//!
//! Entries are removed only after their step succeeds. Entries of a node
//! the registry lists as unreachable are left untouched. A node listed as
//! reachable that does not answer in time, and any other failure, push the
//! entry's next timed retry out with backoff.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use reef_types::{ClusterEvent, NodeId, PendingCleanup, unix_millis};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::service::VolumeService;

/// What happened to one replayed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Step succeeded, entry removed.
    Removed,
    /// Node still unreachable, entry untouched.
    Untouched,
    /// Step failed, entry rescheduled with backoff.
    Rescheduled,
    /// Node listed as reachable but did not answer, entry backed off.
    Stalled,
    /// Entry already being replayed by another task.
    Skipped,
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries removed.
    pub removed: usize,
    /// Entries left for a later recovery signal.
    pub untouched: usize,
    /// Entries rescheduled after a failure.
    pub rescheduled: usize,
    /// Entries backed off because their node did not answer.
    pub stalled: usize,
    /// Entries skipped because they were in flight.
    pub skipped: usize,
}

impl ReplayReport {
    fn record(&mut self, outcome: ReplayOutcome) {
        match outcome {
            ReplayOutcome::Removed => self.removed += 1,
            ReplayOutcome::Untouched => self.untouched += 1,
            ReplayOutcome::Rescheduled => self.rescheduled += 1,
            ReplayOutcome::Stalled => self.stalled += 1,
            ReplayOutcome::Skipped => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: ReplayReport) {
        self.removed += other.removed;
        self.untouched += other.untouched;
        self.rescheduled += other.rescheduled;
        self.stalled += other.stalled;
        self.skipped += other.skipped;
    }

    /// Entries that were actually attempted.
    pub fn attempted(&self) -> usize {
        self.removed + self.untouched + self.rescheduled + self.stalled
    }
}

/// Replays deferred teardown steps.
pub struct RecoveryWorker {
    service: Arc<VolumeService>,
    backoff: Backoff,
    /// Semaphore limiting nodes replayed concurrently during a sweep.
    concurrency: Arc<Semaphore>,
    /// Ledger keys currently being replayed.
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Total entries removed since the worker started.
    completed: Arc<AtomicU64>,
    /// Total failed replay attempts since the worker started.
    failed: Arc<AtomicU64>,
}

impl RecoveryWorker {
    /// Create a worker over `service`, tuned by its config.
    pub fn new(service: Arc<VolumeService>) -> Arc<Self> {
        let config = *service.config();
        Arc::new(Self {
            service,
            backoff: Backoff::from_config(&config),
            concurrency: Arc::new(Semaphore::new(config.max_concurrent_cleanups.max(1) as usize)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Total entries removed since start.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Total failed replay attempts (non-reachability errors) since start.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Run the worker loop until shutdown or until the event channel closes.
    ///
    /// This should be spawned as a background task.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("recovery worker started");
        let mut tick = interval(self.service.config().sweep_interval());

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed recovery signals are covered by a full sweep.
                        warn!(skipped = n, "recovery worker lagged behind event stream");
                        self.sweep().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("recovery worker shutting down, event channel closed");
                        break;
                    }
                },
                _ = tick.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    info!("recovery worker shutting down");
                    break;
                }
            }
        }

        info!(
            completed = self.completed(),
            failed = self.failed(),
            "recovery worker stopped"
        );
    }

    async fn handle_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::NodeReachable(node) | ClusterEvent::NodeRegistered(node) => {
                let report = self.replay_node(&node).await;
                if report.attempted() > 0 {
                    info!(%node, removed = report.removed, rescheduled = report.rescheduled, stalled = report.stalled, untouched = report.untouched, "replayed pending cleanups");
                }
                if let Err(e) = self.service.on_node_reachable(&node) {
                    error!(%node, error = %e, "failed to refresh volume health");
                }
            }
            ClusterEvent::NodeUnreachable(node) => {
                if let Err(e) = self.service.on_node_unreachable(&node) {
                    error!(%node, error = %e, "failed to mark volumes degraded");
                }
            }
        }
    }

    /// Replay every ledger entry for `node`, ignoring backoff.
    ///
    /// Nexus entries run before replica entries.
    #[instrument(skip(self), fields(node = %node))]
    pub async fn replay_node(&self, node: &NodeId) -> ReplayReport {
        match self.service.meta().pending_for_node(node) {
            Ok(entries) => {
                replay_sequence(
                    entries,
                    &self.service,
                    &self.backoff,
                    &self.in_flight,
                    &self.completed,
                    &self.failed,
                )
                .await
            }
            Err(e) => {
                error!(error = %e, "failed to read pending cleanups");
                ReplayReport::default()
            }
        }
    }

    /// Replay due entries on reachable nodes, one task per node.
    pub async fn sweep(&self) -> ReplayReport {
        let entries = match self.service.meta().list_pending() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to read pending cleanups");
                return ReplayReport::default();
            }
        };
        let now = unix_millis();
        let mut by_node: BTreeMap<NodeId, Vec<PendingCleanup>> = BTreeMap::new();
        for entry in entries {
            if entry.is_due(now) && self.service.registry().is_reachable(entry.task.node()) {
                by_node
                    .entry(entry.task.node().clone())
                    .or_default()
                    .push(entry);
            }
        }
        if by_node.is_empty() {
            return ReplayReport::default();
        }
        debug!(nodes = by_node.len(), "sweeping pending cleanups");

        let mut set = JoinSet::new();
        for (_, entries) in by_node {
            let permit = match self.concurrency.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let service = self.service.clone();
            let backoff = self.backoff;
            let in_flight = self.in_flight.clone();
            let completed = self.completed.clone();
            let failed = self.failed.clone();
            set.spawn(async move {
                let _permit = permit;
                replay_sequence(entries, &service, &backoff, &in_flight, &completed, &failed).await
            });
        }

        let mut report = ReplayReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(node_report) => report.merge(node_report),
                Err(e) => error!(error = %e, "sweep task failed"),
            }
        }
        if report.attempted() > 0 {
            info!(
                removed = report.removed,
                rescheduled = report.rescheduled,
                stalled = report.stalled,
                completed = self.completed(),
                failed = self.failed(),
                "sweep finished"
            );
        }
        report
    }
}

/// Replay one node's entries in rank order, stopping at the first
/// reachability failure or stall (the rest would fail the same way).
async fn replay_sequence(
    mut entries: Vec<PendingCleanup>,
    service: &VolumeService,
    backoff: &Backoff,
    in_flight: &Mutex<HashSet<String>>,
    completed: &AtomicU64,
    failed: &AtomicU64,
) -> ReplayReport {
    entries.sort_by_key(|e| e.task.rank());
    let mut report = ReplayReport::default();
    let mut remaining = entries.len();
    for entry in entries {
        remaining -= 1;
        let outcome = replay_entry(entry, service, backoff, in_flight, completed, failed).await;
        report.record(outcome);
        if matches!(outcome, ReplayOutcome::Untouched | ReplayOutcome::Stalled) {
            report.untouched += remaining;
            break;
        }
    }
    report
}

async fn replay_entry(
    mut entry: PendingCleanup,
    service: &VolumeService,
    backoff: &Backoff,
    in_flight: &Mutex<HashSet<String>>,
    completed: &AtomicU64,
    failed: &AtomicU64,
) -> ReplayOutcome {
    let key = entry.key();
    let key_str = key.to_string();
    if !in_flight
        .lock()
        .expect("lock poisoned")
        .insert(key_str.clone())
    {
        return ReplayOutcome::Skipped;
    }

    let outcome = match service.teardown().run(&entry.task).await {
        Ok(()) => match service.meta().remove_pending(&key) {
            Ok(()) => {
                completed.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key_str, task = entry.task.kind(), "pending cleanup completed");
                ReplayOutcome::Removed
            }
            Err(e) => {
                error!(key = %key_str, error = %e, "failed to remove completed pending cleanup");
                ReplayOutcome::Rescheduled
            }
        },
        Err(e) if e.is_unreachable() && service.registry().is_reachable(entry.task.node()) => {
            entry.timeouts = entry.timeouts.saturating_add(1);
            entry.last_error = Some(e.to_string());
            let delay = backoff.delay_ms(entry.timeouts);
            entry.next_attempt_ms = unix_millis() + delay;
            warn!(key = %key_str, timeouts = entry.timeouts, delay_ms = delay, "node not answering, pending cleanup backed off");
            if let Err(e) = service.meta().put_pending(&entry) {
                error!(key = %key_str, error = %e, "failed to reschedule pending cleanup");
            }
            ReplayOutcome::Stalled
        }
        Err(e) if e.is_unreachable() => {
            debug!(key = %key_str, "node still unreachable");
            ReplayOutcome::Untouched
        }
        Err(e) => {
            failed.fetch_add(1, Ordering::Relaxed);
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(e.to_string());
            let delay = backoff.delay_ms(entry.attempts);
            entry.next_attempt_ms = unix_millis() + delay;
            warn!(key = %key_str, attempts = entry.attempts, delay_ms = delay, error = %e, "pending cleanup failed, rescheduled");
            if let Err(e) = service.meta().put_pending(&entry) {
                error!(key = %key_str, error = %e, "failed to reschedule pending cleanup");
            }
            ReplayOutcome::Rescheduled
        }
    };

    in_flight.lock().expect("lock poisoned").remove(&key_str);
    outcome
}
