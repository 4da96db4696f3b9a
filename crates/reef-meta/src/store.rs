//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;
use std::sync::Mutex;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use reef_types::{NodeId, PendingCleanup, PendingKey, Pool, PoolId, Volume, VolumeId, VolumeStatus};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Outcome of a conditional status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The record was in an allowed status and now carries the new one.
    Applied(Volume),
    /// The record exists but its status was not in the allowed set.
    Rejected(Volume),
    /// No record with that id.
    Missing,
}

/// Durable control-plane state backed by Fjall.
///
/// Read-modify-write operations on volume records are serialised by an
/// internal lock, so two concurrent [`MetaStore::transition_status`] calls
/// on the same record can never both succeed.
pub struct MetaStore {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// VolumeId → serialized Volume.
    volumes: Keyspace,
    /// PoolId → serialized Pool.
    pools: Keyspace,
    /// `node/volume/object` → serialized PendingCleanup.
    pending: Keyspace,
    /// Guards read-modify-write on `volumes`.
    cas: Mutex<()>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self> {
        let volumes = db.keyspace("volumes", KeyspaceCreateOptions::default)?;
        let pools = db.keyspace("pools", KeyspaceCreateOptions::default)?;
        let pending = db.keyspace("pending", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            volumes,
            pools,
            pending,
            cas: Mutex::new(()),
        })
    }

    // ----- Volumes -----

    /// Store a volume record, replacing any existing one.
    pub fn put_volume(&self, volume: &Volume) -> Result<()> {
        let _guard = self.cas.lock().expect("lock poisoned");
        self.write_volume(volume)
    }

    /// Store a volume record only if no record with its id exists.
    ///
    /// Returns `false` (and leaves the store untouched) if one already does.
    pub fn insert_volume_if_absent(&self, volume: &Volume) -> Result<bool> {
        let _guard = self.cas.lock().expect("lock poisoned");
        if self.volumes.get(volume.id.as_str().as_bytes())?.is_some() {
            return Ok(false);
        }
        self.write_volume(volume)?;
        Ok(true)
    }

    /// Retrieve a volume record.
    pub fn get_volume(&self, id: &VolumeId) -> Result<Option<Volume>> {
        match self.volumes.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all volume records, ordered by id.
    pub fn list_volumes(&self) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for guard in self.volumes.iter() {
            let v = guard.value()?;
            volumes.push(postcard::from_bytes(&v)?);
        }
        Ok(volumes)
    }

    /// Remove a volume record. Removing an absent record is a no-op.
    pub fn remove_volume(&self, id: &VolumeId) -> Result<()> {
        let _guard = self.cas.lock().expect("lock poisoned");
        self.volumes.remove(id.as_str().as_bytes())?;
        debug!(volume = %id, "removed volume record");
        Ok(())
    }

    /// Atomically set `to` on the record if its status is one of `from`.
    pub fn transition_status(
        &self,
        id: &VolumeId,
        from: &[VolumeStatus],
        to: VolumeStatus,
    ) -> Result<Transition> {
        let _guard = self.cas.lock().expect("lock poisoned");
        let Some(mut volume) = self.get_volume(id)? else {
            return Ok(Transition::Missing);
        };
        if !from.contains(&volume.status) {
            return Ok(Transition::Rejected(volume));
        }
        let previous = volume.status;
        volume.status = to;
        self.write_volume(&volume)?;
        debug!(volume = %id, ?previous, status = ?to, "volume status transition");
        Ok(Transition::Applied(volume))
    }

    /// Apply `f` to the stored record under the store lock and persist the result.
    ///
    /// Returns the updated record, or `None` if it does not exist.
    pub fn update_volume<F>(&self, id: &VolumeId, f: F) -> Result<Option<Volume>>
    where
        F: FnOnce(&mut Volume),
    {
        let _guard = self.cas.lock().expect("lock poisoned");
        let Some(mut volume) = self.get_volume(id)? else {
            return Ok(None);
        };
        f(&mut volume);
        self.write_volume(&volume)?;
        Ok(Some(volume))
    }

    fn write_volume(&self, volume: &Volume) -> Result<()> {
        let value = postcard::to_allocvec(volume)?;
        self.volumes
            .insert(volume.id.as_str().as_bytes(), value.as_slice())?;
        debug!(volume = %volume.id, status = ?volume.status, "stored volume");
        Ok(())
    }

    // ----- Pools -----

    /// Store or replace a pool.
    pub fn put_pool(&self, pool: &Pool) -> Result<()> {
        let value = postcard::to_allocvec(pool)?;
        self.pools.insert(pool.id.as_str().as_bytes(), value.as_slice())?;
        debug!(pool = %pool.id, node = %pool.node, "stored pool");
        Ok(())
    }

    /// Retrieve a pool.
    pub fn get_pool(&self, id: &PoolId) -> Result<Option<Pool>> {
        match self.pools.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all pools, ordered by id.
    pub fn list_pools(&self) -> Result<Vec<Pool>> {
        let mut pools = Vec::new();
        for guard in self.pools.iter() {
            let v = guard.value()?;
            pools.push(postcard::from_bytes(&v)?);
        }
        Ok(pools)
    }

    // ----- Pending cleanups -----

    /// Record a deferred teardown step, replacing any entry with the same key.
    pub fn put_pending(&self, entry: &PendingCleanup) -> Result<()> {
        let key = entry.key().to_string();
        let value = postcard::to_allocvec(entry)?;
        self.pending.insert(key.as_bytes(), value.as_slice())?;
        debug!(%key, task = entry.task.kind(), attempts = entry.attempts, "stored pending cleanup");
        Ok(())
    }

    /// Retrieve a pending entry by key.
    pub fn get_pending(&self, key: &PendingKey) -> Result<Option<PendingCleanup>> {
        match self.pending.get(key.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a pending entry. Removing an absent entry is a no-op.
    pub fn remove_pending(&self, key: &PendingKey) -> Result<()> {
        let key = key.to_string();
        self.pending.remove(key.as_bytes())?;
        debug!(%key, "removed pending cleanup");
        Ok(())
    }

    /// All pending entries targeting `node`.
    pub fn pending_for_node(&self, node: &NodeId) -> Result<Vec<PendingCleanup>> {
        let prefix = format!("{node}/");
        let mut entries = Vec::new();
        for guard in self.pending.prefix(prefix.as_bytes()) {
            let v = guard.value()?;
            let entry: PendingCleanup = postcard::from_bytes(&v)?;
            // Node names may themselves contain '/', so re-check ownership.
            if entry.task.node() == node {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// All pending entries, ordered by key.
    pub fn list_pending(&self) -> Result<Vec<PendingCleanup>> {
        let mut entries = Vec::new();
        for guard in self.pending.iter() {
            let v = guard.value()?;
            entries.push(postcard::from_bytes(&v)?);
        }
        Ok(entries)
    }

    /// Number of pending entries.
    ///
    /// Note: this is an O(n) scan.
    pub fn pending_len(&self) -> Result<usize> {
        let mut count = 0;
        for guard in self.pending.iter() {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }
}
