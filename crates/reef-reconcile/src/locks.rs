//! Per-volume serialisation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reef_types::VolumeId;
use tokio::sync::OwnedMutexGuard;

/// Single-writer lock per volume id.
///
/// Operations on distinct volumes never contend. Entries with no holder and
/// no waiter are pruned on the next acquisition.
#[derive(Default)]
pub struct VolumeLocks {
    locks: Mutex<HashMap<VolumeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl VolumeLocks {
    /// Create an empty lock table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: &VolumeId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock poisoned");
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(id.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().expect("lock poisoned").len()
    }

    /// Whether no id is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
