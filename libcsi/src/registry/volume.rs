//! Volume Registry: the authoritative set of live volumes.
//!
//! Volumes are keyed by a generated [`VolumeId`] and indexed by the
//! caller-supplied name, which is the idempotency key for creation.  Every id
//! ever issued is remembered so that a deleted volume's id is never handed out
//! again.
//!
//! All state sits behind a single [`RwLock`]: `create`, `expand` and `delete`
//! take the write lock, `get` and `list` the read lock.  Operations that must
//! also consult the [`MountRegistry`](super::MountRegistry) take this lock
//! *first* through [`VolumeRegistry::read`] / [`VolumeRegistry::write`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::ops::Bound;
use std::path::PathBuf;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::CsiError;
use crate::types::{AccessMode, Topology, Volume, VolumeId};

/// Volume-context key carrying the backing path to Node operations.
pub const CONTEXT_BACKING_PATH: &str = "backingPath";

/// A live volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub id: VolumeId,
    /// Caller-supplied name, unique among live volumes.
    pub name: String,
    /// Never decreases while the volume is live.
    pub capacity_bytes: u64,
    /// Directory in the backend namespace holding the volume's data.
    pub backing_path: PathBuf,
    pub access_mode: AccessMode,
    /// Parameters from the create request, echoed in the volume context.
    pub parameters: HashMap<String, String>,
}

impl VolumeRecord {
    /// Wire representation of this volume as seen from `node_id`.
    pub fn to_volume(&self, node_id: &str) -> Volume {
        let mut volume_context = self.parameters.clone();
        volume_context.insert(
            CONTEXT_BACKING_PATH.to_owned(),
            self.backing_path.to_string_lossy().into_owned(),
        );
        Volume {
            volume_id: self.id.clone(),
            capacity_bytes: self.capacity_bytes,
            volume_context,
            accessible_topology: vec![Topology::for_node(node_id)],
        }
    }
}

/// Attributes of a volume about to be created.
#[derive(Debug, Clone)]
pub struct NewVolume {
    pub name: String,
    pub capacity_bytes: u64,
    pub access_mode: AccessMode,
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct VolumeTable {
    volumes: BTreeMap<VolumeId, VolumeRecord>,
    by_name: HashMap<String, VolumeId>,
    issued: HashSet<VolumeId>,
}

impl VolumeTable {
    fn fresh_id(&mut self) -> VolumeId {
        loop {
            let id = VolumeId(format!("dfs-{}", uuid::Uuid::new_v4()));
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }

    fn remove(&mut self, id: &VolumeId) -> Option<VolumeRecord> {
        let record = self.volumes.remove(id)?;
        self.by_name.remove(&record.name);
        Some(record)
    }
}

/// In-memory registry of live volumes.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    table: RwLock<VolumeTable>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a volume, or return the live volume that already has this name.
    ///
    /// The name check, id allocation and insertion happen under one write
    /// lock acquisition, so concurrent identical creates observe each other.
    /// `provision` is awaited under that lock only when a new volume is
    /// allocated; it receives the fresh id and returns the backing path.  If
    /// it fails the registry is left unchanged.
    ///
    /// Returns the record and whether it already existed.  An existing
    /// volume is returned as is: a differing `capacity_bytes` in `new` is
    /// ignored.
    pub async fn create<F, Fut>(
        &self,
        new: NewVolume,
        provision: F,
    ) -> Result<(VolumeRecord, bool), CsiError>
    where
        F: FnOnce(VolumeId) -> Fut,
        Fut: Future<Output = Result<PathBuf, CsiError>>,
    {
        let mut table = self.table.write().await;

        if let Some(id) = table.by_name.get(&new.name)
            && let Some(existing) = table.volumes.get(id)
        {
            debug!(name = %new.name, id = %existing.id, "volume name already registered");
            return Ok((existing.clone(), true));
        }

        let id = table.fresh_id();
        let backing_path = provision(id.clone()).await?;

        let record = VolumeRecord {
            id: id.clone(),
            name: new.name,
            capacity_bytes: new.capacity_bytes,
            backing_path,
            access_mode: new.access_mode,
            parameters: new.parameters,
        };
        table.by_name.insert(record.name.clone(), id.clone());
        table.volumes.insert(id, record.clone());
        Ok((record, false))
    }

    /// Look up a live volume.
    pub async fn get(&self, id: &VolumeId) -> Result<VolumeRecord, CsiError> {
        self.table
            .read()
            .await
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(id.to_string()))
    }

    /// Raise the capacity to `new_bytes`.  A smaller value is clamped: the
    /// capacity never shrinks.
    pub async fn expand(&self, id: &VolumeId, new_bytes: u64) -> Result<VolumeRecord, CsiError> {
        let mut table = self.table.write().await;
        let record = table
            .volumes
            .get_mut(id)
            .ok_or_else(|| CsiError::VolumeNotFound(id.to_string()))?;
        record.capacity_bytes = record.capacity_bytes.max(new_bytes);
        Ok(record.clone())
    }

    /// Snapshot of every live volume, ordered by id.
    pub async fn list(&self) -> Vec<VolumeRecord> {
        self.table.read().await.volumes.values().cloned().collect()
    }

    /// Up to `max_entries` volumes (all when zero) with ids strictly after
    /// `after`, ordered by id.  The second element is the id to resume from
    /// when more volumes remain.
    pub async fn list_page(
        &self,
        after: Option<&VolumeId>,
        max_entries: usize,
    ) -> (Vec<VolumeRecord>, Option<VolumeId>) {
        let table = self.table.read().await;
        let lower: Bound<&VolumeId> = after.map_or(Bound::Unbounded, Bound::Excluded);
        let upper: Bound<&VolumeId> = Bound::Unbounded;
        let mut remaining = table.volumes.range::<VolumeId, _>((lower, upper));

        let limit = if max_entries == 0 {
            usize::MAX
        } else {
            max_entries
        };
        let page: Vec<VolumeRecord> = remaining
            .by_ref()
            .take(limit)
            .map(|(_, v)| v.clone())
            .collect();
        let next = match (remaining.next(), page.last()) {
            (Some(_), Some(last)) => Some(last.id.clone()),
            _ => None,
        };
        (page, next)
    }

    /// Hold the read lock, e.g. while consulting the Mount Registry.
    pub async fn read(&self) -> VolumeReadGuard<'_> {
        VolumeReadGuard {
            table: self.table.read().await,
        }
    }

    /// Hold the write lock, e.g. across a mount check and the delete.
    pub async fn write(&self) -> VolumeWriteGuard<'_> {
        VolumeWriteGuard {
            table: self.table.write().await,
        }
    }
}

/// Read access to the registry for the duration of a multi-step operation.
pub struct VolumeReadGuard<'a> {
    table: RwLockReadGuard<'a, VolumeTable>,
}

impl VolumeReadGuard<'_> {
    pub fn get(&self, id: &VolumeId) -> Option<&VolumeRecord> {
        self.table.volumes.get(id)
    }
}

/// Exclusive access to the registry for the duration of a multi-step
/// operation.
pub struct VolumeWriteGuard<'a> {
    table: RwLockWriteGuard<'a, VolumeTable>,
}

impl VolumeWriteGuard<'_> {
    pub fn get(&self, id: &VolumeId) -> Option<&VolumeRecord> {
        self.table.volumes.get(id)
    }

    /// Remove a volume.  The caller checks that nothing still mounts it.
    pub fn remove(&mut self, id: &VolumeId) -> Option<VolumeRecord> {
        self.table.remove(id)
    }
}
