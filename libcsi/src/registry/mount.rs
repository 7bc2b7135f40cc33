//! Mount Registry: which target paths are currently bound to which volume.
//!
//! Publishing and unpublishing call out to the Mount Executor, which may
//! block for a long time.  Instead of holding the lock across that call, an
//! entry moves through provisional states:
//!
//! ```text
//!            publish            commit_publish
//!   (none) ──────────▶ Publishing ──────────▶ Published
//!     ▲                    │ abort_publish        │ begin_unpublish
//!     └────────────────────┘                      ▼
//!     ▲           unpublish                 Unpublishing
//!     └─────────────────────────────────────────┘ │ abort_unpublish
//!                                                 └──────▶ Published
//! ```
//!
//! While an entry is in flight any other call on the same target fails fast
//! with [`CsiError::Aborted`]; calls on other targets are unaffected.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::CsiError;
use crate::types::VolumeId;

/// A volume bound to a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub volume_id: VolumeId,
    pub target_path: String,
    pub fs_type: String,
    pub read_only: bool,
}

/// Lifecycle state of a [`MountRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Marker installed; the executor has not finished mounting.
    Publishing,
    /// Mounted and recorded.
    Published,
    /// Marker installed; the executor has not finished unmounting.
    Unpublishing,
}

#[derive(Debug)]
struct MountEntry {
    record: MountRecord,
    state: MountState,
}

/// In-memory registry of mounts on this node, keyed by target path.
#[derive(Debug, Default)]
pub struct MountRegistry {
    mounts: RwLock<HashMap<String, MountEntry>>,
}

fn in_progress(target_path: &str) -> CsiError {
    CsiError::Aborted(format!("an operation on {target_path} is already in progress"))
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `record.target_path` for `record.volume_id`.
    ///
    /// Returns `(existing, true)` when the same volume is already published
    /// there with the same options; the caller has nothing to do.  Otherwise
    /// installs a [`MountState::Publishing`] marker and returns
    /// `(record, false)`; the caller must follow up with
    /// [`commit_publish`](Self::commit_publish) or
    /// [`abort_publish`](Self::abort_publish).
    ///
    /// With `exclusive_writer`, a writable claim is refused while another
    /// writable mount of the same volume exists on a different target.
    pub async fn publish(
        &self,
        record: MountRecord,
        exclusive_writer: bool,
    ) -> Result<(MountRecord, bool), CsiError> {
        let mut mounts = self.mounts.write().await;

        if let Some(entry) = mounts.get(&record.target_path) {
            return match entry.state {
                MountState::Publishing | MountState::Unpublishing => {
                    Err(in_progress(&record.target_path))
                }
                MountState::Published if entry.record.volume_id != record.volume_id => {
                    Err(CsiError::FailedPrecondition(format!(
                        "{} is already bound to volume {}",
                        record.target_path, entry.record.volume_id
                    )))
                }
                MountState::Published if entry.record.read_only != record.read_only => {
                    Err(CsiError::FailedPrecondition(format!(
                        "volume {} is already published at {} with read_only={}",
                        record.volume_id, record.target_path, entry.record.read_only
                    )))
                }
                MountState::Published => Ok((entry.record.clone(), true)),
            };
        }

        if exclusive_writer
            && !record.read_only
            && let Some(writer) = mounts
                .values()
                .find(|e| e.record.volume_id == record.volume_id && !e.record.read_only)
        {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} already has a writable mount at {}",
                record.volume_id, writer.record.target_path
            )));
        }

        debug!(volume_id = %record.volume_id, target_path = %record.target_path, "mount reserved");
        mounts.insert(
            record.target_path.clone(),
            MountEntry {
                record: record.clone(),
                state: MountState::Publishing,
            },
        );
        Ok((record, false))
    }

    /// Promote a `Publishing` marker to a published mount.  Returns `false`
    /// if no such marker exists.
    pub async fn commit_publish(&self, target_path: &str) -> bool {
        match self.mounts.write().await.get_mut(target_path) {
            Some(entry) if entry.state == MountState::Publishing => {
                entry.state = MountState::Published;
                true
            }
            _ => false,
        }
    }

    /// Drop a `Publishing` marker.
    pub async fn abort_publish(&self, target_path: &str) {
        let mut mounts = self.mounts.write().await;
        if mounts
            .get(target_path)
            .is_some_and(|e| e.state == MountState::Publishing)
        {
            mounts.remove(target_path);
        }
    }

    /// Mark the mount at `target_path` as being torn down.
    ///
    /// Returns `None` if nothing is mounted there, which the Node service
    /// treats as an already-completed unpublish.
    pub async fn begin_unpublish(&self, target_path: &str) -> Result<Option<MountRecord>, CsiError> {
        let mut mounts = self.mounts.write().await;
        let Some(entry) = mounts.get_mut(target_path) else {
            return Ok(None);
        };
        if entry.state != MountState::Published {
            return Err(in_progress(target_path));
        }
        entry.state = MountState::Unpublishing;
        Ok(Some(entry.record.clone()))
    }

    /// Put an `Unpublishing` mount back after a failed unmount.
    pub async fn abort_unpublish(&self, target_path: &str) {
        if let Some(entry) = self.mounts.write().await.get_mut(target_path)
            && entry.state == MountState::Unpublishing
        {
            entry.state = MountState::Published;
        }
    }

    /// Forget the mount at `target_path`.
    pub async fn unpublish(&self, target_path: &str) -> Result<MountRecord, CsiError> {
        let mut mounts = self.mounts.write().await;
        match mounts.get(target_path).map(|e| e.state) {
            None => Err(CsiError::MountNotFound(target_path.to_owned())),
            Some(MountState::Publishing) => Err(in_progress(target_path)),
            Some(MountState::Published | MountState::Unpublishing) => mounts
                .remove(target_path)
                .map(|e| e.record)
                .ok_or_else(|| CsiError::MountNotFound(target_path.to_owned())),
        }
    }

    /// The published mount at `target_path`.
    pub async fn get(&self, target_path: &str) -> Result<MountRecord, CsiError> {
        match self.mounts.read().await.get(target_path) {
            Some(entry) if entry.state == MountState::Published => Ok(entry.record.clone()),
            _ => Err(CsiError::MountNotFound(target_path.to_owned())),
        }
    }

    /// Every mount referencing `volume_id`, including ones still in flight.
    pub async fn find_by_volume(&self, volume_id: &VolumeId) -> Vec<MountRecord> {
        self.mounts
            .read()
            .await
            .values()
            .filter(|e| &e.record.volume_id == volume_id)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Settled mounts of `volume_id`; in-flight markers are skipped.
    pub async fn published_by_volume(&self, volume_id: &VolumeId) -> Vec<MountRecord> {
        self.mounts
            .read()
            .await
            .values()
            .filter(|e| &e.record.volume_id == volume_id && e.state == MountState::Published)
            .map(|e| e.record.clone())
            .collect()
    }

    /// State of the entry at `target_path`, if any.
    pub async fn state(&self, target_path: &str) -> Option<MountState> {
        self.mounts.read().await.get(target_path).map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(volume: &str, target: &str, read_only: bool) -> MountRecord {
        MountRecord {
            volume_id: VolumeId::from(volume),
            target_path: target.to_owned(),
            fs_type: "bind".to_owned(),
            read_only,
        }
    }

    async fn published(registry: &MountRegistry, volume: &str, target: &str, read_only: bool) {
        let (_, existed) = registry
            .publish(record(volume, target, read_only), false)
            .await
            .unwrap();
        assert!(!existed);
        assert!(registry.commit_publish(target).await);
    }

    #[tokio::test]
    async fn republish_is_a_no_op() {
        let registry = MountRegistry::new();
        published(&registry, "v1", "/mnt/a", false).await;

        let (existing, existed) = registry
            .publish(record("v1", "/mnt/a", false), false)
            .await
            .unwrap();
        assert!(existed);
        assert_eq!(existing, record("v1", "/mnt/a", false));
        assert_eq!(registry.find_by_volume(&"v1".into()).await.len(), 1);
    }

    #[tokio::test]
    async fn in_flight_target_fails_fast() {
        let registry = MountRegistry::new();
        registry
            .publish(record("v1", "/mnt/a", false), false)
            .await
            .unwrap();

        let second = registry.publish(record("v1", "/mnt/a", false), false).await;
        assert!(matches!(second, Err(CsiError::Aborted(_))));
        assert!(matches!(
            registry.begin_unpublish("/mnt/a").await,
            Err(CsiError::Aborted(_))
        ));
        // Not visible as a live mount yet, but it does reference the volume.
        assert!(registry.get("/mnt/a").await.is_err());
        assert_eq!(registry.find_by_volume(&"v1".into()).await.len(), 1);
        assert!(registry.published_by_volume(&"v1".into()).await.is_empty());

        // Other targets are unaffected.
        published(&registry, "v1", "/mnt/b", true).await;
        let settled = registry.published_by_volume(&"v1".into()).await;
        assert_eq!(settled, [record("v1", "/mnt/b", true)]);
    }

    #[tokio::test]
    async fn abort_frees_the_target() {
        let registry = MountRegistry::new();
        registry
            .publish(record("v1", "/mnt/a", false), false)
            .await
            .unwrap();
        registry.abort_publish("/mnt/a").await;
        assert_eq!(registry.state("/mnt/a").await, None);
        assert!(!registry.commit_publish("/mnt/a").await);
        published(&registry, "v1", "/mnt/a", false).await;
    }

    #[tokio::test]
    async fn target_belongs_to_one_volume() {
        let registry = MountRegistry::new();
        published(&registry, "v1", "/mnt/a", false).await;

        let other = registry.publish(record("v2", "/mnt/a", false), false).await;
        assert!(matches!(other, Err(CsiError::FailedPrecondition(_))));
        let flipped = registry.publish(record("v1", "/mnt/a", true), false).await;
        assert!(matches!(flipped, Err(CsiError::FailedPrecondition(_))));
    }

    #[tokio::test]
    async fn single_writer_allows_extra_readers_only() {
        let registry = MountRegistry::new();
        registry
            .publish(record("v1", "/mnt/w", false), true)
            .await
            .unwrap();
        registry.commit_publish("/mnt/w").await;

        let writer = registry.publish(record("v1", "/mnt/w2", false), true).await;
        assert!(matches!(writer, Err(CsiError::FailedPrecondition(_))));

        let (_, existed) = registry
            .publish(record("v1", "/mnt/r", true), true)
            .await
            .unwrap();
        assert!(!existed);

        // Multi-writer volumes are not restricted.
        registry
            .publish(record("v1", "/mnt/w3", false), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unpublish_lifecycle() {
        let registry = MountRegistry::new();
        assert!(registry.begin_unpublish("/mnt/a").await.unwrap().is_none());
        assert!(matches!(
            registry.unpublish("/mnt/a").await,
            Err(CsiError::MountNotFound(_))
        ));

        published(&registry, "v1", "/mnt/a", false).await;
        let rec = registry.begin_unpublish("/mnt/a").await.unwrap().unwrap();
        assert_eq!(rec.volume_id, VolumeId::from("v1"));
        assert_eq!(registry.state("/mnt/a").await, Some(MountState::Unpublishing));

        registry.abort_unpublish("/mnt/a").await;
        assert_eq!(registry.get("/mnt/a").await.unwrap(), rec);

        registry.begin_unpublish("/mnt/a").await.unwrap();
        registry.unpublish("/mnt/a").await.unwrap();
        assert!(registry.find_by_volume(&"v1".into()).await.is_empty());
        assert!(matches!(
            registry.get("/mnt/a").await,
            Err(CsiError::MountNotFound(_))
        ));
    }
}
