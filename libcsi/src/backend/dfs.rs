//! Distributed-filesystem storage backend for CSI.
//!
//! [`DfsBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`] on top of two in-memory registries.  Each volume is a
//! directory in the distributed backend's namespace (allocated through a
//! [`VolumeStore`]) that is bind-mounted onto workload target paths by a
//! [`Mounter`].
//!
//! # Concurrency
//!
//! Requests run concurrently.  Operations that touch both registries take the
//! volume lock before the mount lock.  Publishing and unpublishing never hold
//! a registry lock across the executor call: a provisional marker in the
//! [`MountRegistry`] claims the target, and a detached task finalizes it once
//! the executor returns, so the registry stays consistent even if the caller
//! gives up (deadline) mid-way.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::config::PluginConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mounter::Mounter;
use crate::node::CsiNode;
use crate::registry::{MountRecord, MountRegistry, NewVolume, VolumeRegistry};
use crate::store::{LocalVolumeStore, VolumeStore};
use crate::types::*;

/// Concrete CSI plugin backed by a distributed filesystem namespace.
pub struct DfsBackend {
    config: PluginConfig,
    volumes: Arc<VolumeRegistry>,
    mounts: Arc<MountRegistry>,
    mounter: Arc<dyn Mounter>,
    store: Arc<dyn VolumeStore>,
}

impl DfsBackend {
    /// Create a backend with empty registries.
    pub fn new(
        config: PluginConfig,
        mounter: Arc<dyn Mounter>,
        store: Arc<dyn VolumeStore>,
    ) -> Self {
        Self {
            config,
            volumes: Arc::new(VolumeRegistry::new()),
            mounts: Arc::new(MountRegistry::new()),
            mounter,
            store,
        }
    }

    /// Backend whose backing directories live under `config.volume_root`.
    pub fn with_local_store(config: PluginConfig, mounter: Arc<dyn Mounter>) -> Self {
        let store = Arc::new(LocalVolumeStore::new(config.volume_root.clone()));
        Self::new(config, mounter, store)
    }

    /// Prepare the backing store so that `Probe` reports ready.  Called once
    /// at startup, before serving.
    pub async fn init(&self) -> Result<(), CsiError> {
        self.store.prepare().await
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn volumes(&self) -> &VolumeRegistry {
        &self.volumes
    }

    pub fn mounts(&self) -> &MountRegistry {
        &self.mounts
    }
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

/// Run a blocking executor call on Tokio's blocking pool.
async fn run_blocking<F>(f: F) -> Result<(), CsiError>
where
    F: FnOnce() -> Result<(), CsiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(CsiError::internal)?
}

/// Compute usage entries from raw `statvfs` counters.
///
/// `used` is derived as `total - available` so that the two always add up to
/// `total`, even on filesystems that reserve blocks for root.
fn usage_from_counts(
    fragment_size: u64,
    blocks: u64,
    blocks_available: u64,
    files: u64,
    files_free: u64,
) -> VolumeStats {
    let total = blocks.saturating_mul(fragment_size);
    let available = blocks_available.saturating_mul(fragment_size).min(total);
    let files_free = files_free.min(files);
    VolumeStats {
        usage: vec![
            VolumeUsage {
                available,
                total,
                used: total - available,
                unit: UsageUnit::Bytes,
            },
            VolumeUsage {
                available: files_free,
                total: files,
                used: files - files_free,
                unit: UsageUnit::Inodes,
            },
        ],
    }
}

/// Second half of `NodePublishVolume`, run detached from the request.
///
/// The target directory is created and the executor invoked.  On success the
/// marker is committed, unless the caller has already gone away, in which
/// case the mount is rolled back.  On failure the marker is dropped.  Either
/// way a target directory created here is removed again.
async fn finish_publish(
    mounts: Arc<MountRegistry>,
    mounter: Arc<dyn Mounter>,
    source: PathBuf,
    record: MountRecord,
    options: Vec<String>,
    reply: oneshot::Sender<Result<(), CsiError>>,
) {
    let target = PathBuf::from(&record.target_path);
    let created = !tokio::fs::try_exists(&target).await.unwrap_or(true);

    let outcome = match tokio::fs::create_dir_all(&target).await {
        Ok(()) => {
            let mounter = Arc::clone(&mounter);
            let target = target.clone();
            let fs_type = record.fs_type.clone();
            run_blocking(move || mounter.mount(&source, &target, &fs_type, &options)).await
        }
        Err(e) => Err(CsiError::MountFailed {
            path: record.target_path.clone(),
            reason: format!("create target dir: {e}"),
        }),
    };

    match outcome {
        Err(e) => {
            if created {
                remove_target_dir(&target).await;
            }
            mounts.abort_publish(&record.target_path).await;
            let _ = reply.send(Err(e));
        }
        Ok(()) if reply.is_closed() => {
            warn!(target_path = %record.target_path, "caller went away during publish, rolling back");
            let unmount = {
                let target = target.clone();
                run_blocking(move || mounter.unmount(&target)).await
            };
            match unmount {
                Ok(()) => {
                    if created {
                        remove_target_dir(&target).await;
                    }
                    mounts.abort_publish(&record.target_path).await;
                }
                Err(e) => {
                    // The mount is still in place; keep the record so that
                    // a retry or unpublish can find it.
                    warn!(target_path = %record.target_path, error = %e, "rollback unmount failed");
                    mounts.commit_publish(&record.target_path).await;
                }
            }
        }
        Ok(()) => {
            mounts.commit_publish(&record.target_path).await;
            info!(
                volume_id = %record.volume_id,
                target_path = %record.target_path,
                read_only = record.read_only,
                "volume published (bind-mount)",
            );
            let _ = reply.send(Ok(()));
        }
    }
}

/// Second half of `NodeUnpublishVolume`, run detached from the request.
async fn finish_unpublish(
    mounts: Arc<MountRegistry>,
    mounter: Arc<dyn Mounter>,
    record: MountRecord,
    reply: oneshot::Sender<Result<(), CsiError>>,
) {
    let target = PathBuf::from(&record.target_path);
    let unmount = {
        let target = target.clone();
        run_blocking(move || mounter.unmount(&target)).await
    };

    if let Err(e) = unmount {
        mounts.abort_unpublish(&record.target_path).await;
        let _ = reply.send(Err(e));
        return;
    }

    if let Err(e) = mounts.unpublish(&record.target_path).await {
        warn!(target_path = %record.target_path, error = %e, "mount record vanished during unpublish");
    }
    remove_target_dir(&target).await;
    info!(volume_id = %record.volume_id, target_path = %record.target_path, "volume unpublished");
    let _ = reply.send(Ok(()));
}

/// Only removes the directory if it is empty.
async fn remove_target_dir(target: &Path) {
    match tokio::fs::remove_dir(target).await {
        Ok(()) => debug!(target_path = %target.display(), "target directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(target_path = %target.display(), error = %e, "target directory left in place")
        }
    }
}

async fn await_reply(rx: oneshot::Receiver<Result<(), CsiError>>) -> Result<(), CsiError> {
    rx.await
        .map_err(|_| CsiError::Internal("mount task ended without a result".into()))?
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for DfsBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Ready once the backend namespace is reachable.
        Ok(self.store.is_ready().await)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for DfsBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        require(&req.name, "volume name")?;
        let Some(first) = req.volume_capabilities.first() else {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        };
        if req.volume_capabilities.iter().any(VolumeCapability::is_block) {
            return Err(CsiError::InvalidArgument(
                "block volumes are not supported".into(),
            ));
        }
        let capacity_bytes = req
            .capacity_range
            .unwrap_or_default()
            .resolve(self.config.default_capacity_bytes)?;

        let new = NewVolume {
            name: req.name.clone(),
            capacity_bytes,
            access_mode: first.access_mode,
            parameters: req.parameters,
        };
        let store = Arc::clone(&self.store);
        let (record, existed) = self
            .volumes
            .create(new, |id| async move { store.create(&id).await })
            .await?;

        if existed {
            if record.capacity_bytes != capacity_bytes {
                debug!(
                    volume_id = %record.id,
                    existing = record.capacity_bytes,
                    requested = capacity_bytes,
                    "ignoring requested capacity for existing volume",
                );
            }
            debug!(volume_id = %record.id, "returning existing volume for idempotent create");
        } else {
            info!(volume_id = %record.id, capacity_bytes, "volume created");
        }
        Ok(record.to_volume(&self.config.node_id))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        require(volume_id.as_str(), "volume id")?;

        // Volume lock first, held across the mount check and the removal so
        // that no publish can slip in between.
        let mut volumes = self.volumes.write().await;
        let Some(record) = volumes.get(volume_id).cloned() else {
            debug!(%volume_id, "volume already absent");
            return Ok(());
        };

        let mounts = self.mounts.find_by_volume(volume_id).await;
        if let Some(mount) = mounts.first() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still mounted at {}",
                mount.target_path
            )));
        }

        // Remove the data first: if that fails the record stays and a retry
        // starts from the same state.
        self.store.remove(&record.backing_path).await?;
        volumes.remove(volume_id);

        info!(%volume_id, "volume deleted");
        Ok(())
    }

    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<(), CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.node_id, "node id")?;
        self.volumes.get(&req.volume_id).await?;
        // Every node reaches the backend directly; nothing to attach.
        Ok(())
    }

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        require(volume_id.as_str(), "volume id")?;
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        require(volume_id.as_str(), "volume id")?;
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }
        let record = self.volumes.get(volume_id).await?;

        let unsupported = capabilities.iter().find_map(|cap| {
            if cap.is_block() {
                Some("block access type is not supported".to_owned())
            } else if record.access_mode.is_read_only() && !cap.access_mode.is_read_only() {
                Some(format!(
                    "volume was created {:?}, cannot serve {:?}",
                    record.access_mode, cap.access_mode
                ))
            } else {
                None
            }
        });

        Ok(match unsupported {
            Some(message) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            },
            None => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(capabilities.to_vec()),
                message: String::new(),
            },
        })
    }

    async fn list_volumes(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, CsiError> {
        let after = req.starting_token.map(VolumeId);
        let (page, next) = self
            .volumes
            .list_page(after.as_ref(), req.max_entries as usize)
            .await;
        Ok(ListVolumesResponse {
            entries: page
                .iter()
                .map(|record| record.to_volume(&self.config.node_id))
                .collect(),
            next_token: next.map(|id| id.0),
        })
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Ok(UNBOUNDED_CAPACITY)
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::GetCapacity,
            ControllerCapability::ExpandVolume,
            ControllerCapability::GetVolume,
        ])
    }

    #[instrument(skip(self))]
    async fn controller_expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_range: Option<CapacityRange>,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        require(volume_id.as_str(), "volume id")?;
        let range = capacity_range
            .ok_or_else(|| CsiError::InvalidArgument("capacity range is required".into()))?;
        let requested = range.resolve(0)?;

        let record = self.volumes.expand(volume_id, requested).await?;
        info!(%volume_id, capacity_bytes = record.capacity_bytes, "volume expanded");
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: record.capacity_bytes,
            node_expansion_required: true,
        })
    }

    async fn controller_get_volume(
        &self,
        volume_id: &VolumeId,
    ) -> Result<ControllerGetVolumeResponse, CsiError> {
        require(volume_id.as_str(), "volume id")?;

        let volumes = self.volumes.read().await;
        let record = volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
        let mounts = self.mounts.published_by_volume(volume_id).await;
        drop(volumes);

        // Mounts are node-local, so any settled mount means "published here".
        let published_node_ids = if mounts.is_empty() {
            Vec::new()
        } else {
            vec![self.config.node_id.clone()]
        };
        Ok(ControllerGetVolumeResponse {
            volume: record.to_volume(&self.config.node_id),
            published_node_ids,
        })
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for DfsBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        self.volumes.get(&req.volume_id).await?;
        // Publish binds the backing directory directly; staging has no work.
        debug!(path = %req.staging_target_path, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require(volume_id.as_str(), "volume id")?;
        require(staging_target_path, "staging target path")?;
        debug!(path = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.target_path, "target path")?;
        let capability = &req.volume_capability;
        if capability.is_block() {
            return Err(CsiError::FailedPrecondition(
                "block access type is not supported".into(),
            ));
        }

        // Volume lock first; hold it until the target is claimed so a
        // concurrent delete observes the claim.
        let volumes = self.volumes.read().await;
        let volume = volumes
            .get(&req.volume_id)
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(req.volume_id.to_string()))?;

        let read_only = req.read_only
            || volume.access_mode.is_read_only()
            || capability.access_mode.is_read_only();
        let claim = MountRecord {
            volume_id: req.volume_id.clone(),
            target_path: req.target_path.clone(),
            fs_type: capability.fs_type().to_owned(),
            read_only,
        };
        let (record, existed) = self
            .mounts
            .publish(claim, volume.access_mode.is_single_writer())
            .await?;
        drop(volumes);

        if existed {
            debug!("target already published, assuming idempotent retry");
            return Ok(());
        }

        let mut options = capability.mount_flags().to_vec();
        if read_only {
            options.push("ro".to_owned());
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(finish_publish(
            Arc::clone(&self.mounts),
            Arc::clone(&self.mounter),
            volume.backing_path,
            record,
            options,
            tx,
        ));
        await_reply(rx).await
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require(target_path, "target path")?;

        let Some(record) = self.mounts.begin_unpublish(target_path).await? else {
            debug!(%volume_id, "target not mounted, nothing to unpublish");
            return Ok(());
        };
        if !volume_id.as_str().is_empty() && record.volume_id != *volume_id {
            warn!(
                requested = %volume_id,
                mounted = %record.volume_id,
                "unpublish names a different volume than the one mounted",
            );
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(finish_unpublish(
            Arc::clone(&self.mounts),
            Arc::clone(&self.mounter),
            record,
            tx,
        ));
        await_reply(rx).await
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        require(volume_id.as_str(), "volume id")?;
        require(volume_path, "volume path")?;
        self.volumes.get(volume_id).await?;

        let path = volume_path.to_owned();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(path.as_str()))
            .await
            .map_err(CsiError::internal)?
            .map_err(|e| CsiError::Internal(format!("statvfs {volume_path}: {e}")))?;

        Ok(usage_from_counts(
            stat.fragment_size() as u64,
            stat.blocks() as u64,
            stat.blocks_available() as u64,
            stat.files() as u64,
            stat.files_free() as u64,
        ))
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.volume_path, "volume path")?;

        let current = self.volumes.get(&req.volume_id).await?;
        let mount = self.mounts.get(&req.volume_path).await?;
        if mount.volume_id != req.volume_id {
            return Err(CsiError::MountNotFound(format!(
                "{} (volume {} is not published there)",
                req.volume_path, req.volume_id
            )));
        }

        let requested = match req.capacity_range {
            Some(range) => range.resolve(current.capacity_bytes)?,
            None => current.capacity_bytes,
        };
        let record = self.volumes.expand(&req.volume_id, requested).await?;
        info!(
            volume_path = %req.volume_path,
            capacity_bytes = record.capacity_bytes,
            "node-side expansion applied",
        );
        Ok(record.capacity_bytes)
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::GetVolumeStats,
            NodeCapability::ExpandVolume,
        ])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: self.config.max_volumes_per_node,
            accessible_topology: Some(Topology::for_node(&self.config.node_id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::registry::MountState;

    /// Records executor calls instead of touching the host.
    #[derive(Default)]
    struct FakeMounter {
        calls: Mutex<Vec<String>>,
        fail_mount: AtomicBool,
        fail_unmount: AtomicBool,
        mount_delay: Option<Duration>,
    }

    impl FakeMounter {
        fn slow(delay: Duration) -> Self {
            Self {
                mount_delay: Some(delay),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Mounter for FakeMounter {
        fn mount(
            &self,
            source: &Path,
            target: &Path,
            _fs_type: &str,
            options: &[String],
        ) -> Result<(), CsiError> {
            if let Some(delay) = self.mount_delay {
                std::thread::sleep(delay);
            }
            if self.fail_mount.load(Ordering::SeqCst) {
                return Err(CsiError::MountFailed {
                    path: target.display().to_string(),
                    reason: "injected".into(),
                });
            }
            self.calls.lock().unwrap().push(format!(
                "mount {} {} {}",
                source.display(),
                target.display(),
                options.join(",")
            ));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<(), CsiError> {
            if self.fail_unmount.load(Ordering::SeqCst) {
                return Err(CsiError::UnmountFailed {
                    path: target.display().to_string(),
                    reason: "injected".into(),
                });
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("umount {}", target.display()));
            Ok(())
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        mounter: Arc<FakeMounter>,
        backend: DfsBackend,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_mounter(FakeMounter::default())
        }

        fn with_mounter(mounter: FakeMounter) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let mut config = PluginConfig::new("test-node");
            config.volume_root = tmp.path().join("volumes");
            let mounter = Arc::new(mounter);
            let backend = DfsBackend::with_local_store(config, mounter.clone());
            Self {
                tmp,
                mounter,
                backend,
            }
        }

        fn target(&self, name: &str) -> String {
            self.tmp.path().join("mnt").join(name).display().to_string()
        }

        async fn create(&self, name: &str, bytes: u64) -> Volume {
            self.backend
                .create_volume(create_request(name, bytes, AccessMode::SingleNodeWriter))
                .await
                .unwrap()
        }

        async fn publish(&self, volume_id: &VolumeId, target: &str) -> Result<(), CsiError> {
            self.backend
                .publish_volume(publish_request(volume_id, target, false))
                .await
        }
    }

    fn create_request(name: &str, bytes: u64, mode: AccessMode) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(CapacityRange::required(bytes)),
            volume_capabilities: vec![VolumeCapability::mount(mode)],
            ..Default::default()
        }
    }

    fn publish_request(volume_id: &VolumeId, target: &str, read_only: bool) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: volume_id.clone(),
            target_path: target.to_owned(),
            staging_target_path: None,
            volume_capability: VolumeCapability::default(),
            read_only,
            volume_context: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_and_ignores_new_size() {
        let fx = Fixture::new();
        let first = fx.create("v1", GIB).await;
        let second = fx.create("v1", 3 * GIB).await;

        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(second.capacity_bytes, GIB);
        assert_eq!(fx.backend.volumes().list().await.len(), 1);

        let backing = &first.volume_context[crate::registry::CONTEXT_BACKING_PATH];
        assert!(Path::new(backing).is_dir());
    }

    #[tokio::test]
    async fn create_applies_default_floor() {
        let fx = Fixture::new();
        let vol = fx
            .backend
            .create_volume(CreateVolumeRequest {
                name: "sizeless".into(),
                volume_capabilities: vec![VolumeCapability::default()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(vol.capacity_bytes, DEFAULT_CAPACITY_BYTES);
    }

    #[tokio::test]
    async fn create_validates_before_touching_state() {
        let fx = Fixture::new();
        let no_name = fx
            .backend
            .create_volume(create_request("", GIB, AccessMode::SingleNodeWriter))
            .await;
        assert!(matches!(no_name, Err(CsiError::InvalidArgument(_))));

        let no_caps = fx
            .backend
            .create_volume(CreateVolumeRequest {
                name: "nocaps".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(no_caps, Err(CsiError::InvalidArgument(_))));

        let block = fx
            .backend
            .create_volume(CreateVolumeRequest {
                name: "block".into(),
                volume_capabilities: vec![VolumeCapability {
                    access_mode: AccessMode::SingleNodeWriter,
                    access_type: AccessType::Block,
                }],
                ..Default::default()
            })
            .await;
        assert!(matches!(block, Err(CsiError::InvalidArgument(_))));
        assert!(fx.backend.volumes().list().await.is_empty());
    }

    #[tokio::test]
    async fn create_failure_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let mut config = PluginConfig::new("test-node");
        config.volume_root = blocker;
        let backend = DfsBackend::with_local_store(config, Arc::new(FakeMounter::default()));

        let err = backend
            .create_volume(create_request("v", GIB, AccessMode::SingleNodeWriter))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::Internal);
        assert!(backend.volumes().list().await.is_empty());
    }

    #[tokio::test]
    async fn delete_while_mounted_is_rejected() {
        let fx = Fixture::new();
        let vol = fx.create("v1", GIB).await;
        fx.publish(&vol.volume_id, &fx.target("a")).await.unwrap();

        let err = fx.backend.delete_volume(&vol.volume_id).await.unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));

        let described = fx.backend.controller_get_volume(&vol.volume_id).await.unwrap();
        assert_eq!(described.volume.volume_id, vol.volume_id);
        assert_eq!(described.published_node_ids, vec!["test-node".to_owned()]);
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let fx = Fixture::new();
        let vol = fx.create("v2", GIB).await;
        let backing = PathBuf::from(&vol.volume_context[crate::registry::CONTEXT_BACKING_PATH]);
        let target = fx.target("b");

        fx.publish(&vol.volume_id, &target).await.unwrap();
        assert!(Path::new(&target).is_dir());
        fx.backend
            .unpublish_volume(&vol.volume_id, &target)
            .await
            .unwrap();
        assert!(!Path::new(&target).exists());

        let described = fx.backend.controller_get_volume(&vol.volume_id).await.unwrap();
        assert!(described.published_node_ids.is_empty());

        fx.backend.delete_volume(&vol.volume_id).await.unwrap();
        assert!(!backing.exists());
        // Repeating the delete is a no-op.
        fx.backend.delete_volume(&vol.volume_id).await.unwrap();

        assert_eq!(
            fx.mounter.calls(),
            vec![
                format!("mount {} {} ", backing.display(), target),
                format!("umount {target}"),
            ]
        );
    }

    #[tokio::test]
    async fn capacity_is_monotonic() {
        let fx = Fixture::new();
        let vol = fx.create("grow", GIB).await;

        let grown = fx
            .backend
            .controller_expand_volume(&vol.volume_id, Some(CapacityRange::required(2 * GIB)))
            .await
            .unwrap();
        assert_eq!(grown.capacity_bytes, 2 * GIB);
        assert!(grown.node_expansion_required);

        let clamped = fx
            .backend
            .controller_expand_volume(&vol.volume_id, Some(CapacityRange::required(GIB)))
            .await
            .unwrap();
        assert_eq!(clamped.capacity_bytes, 2 * GIB);

        let missing_range = fx.backend.controller_expand_volume(&vol.volume_id, None).await;
        assert!(matches!(missing_range, Err(CsiError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn publish_and_unpublish_are_idempotent() {
        let fx = Fixture::new();
        let vol = fx.create("idem", GIB).await;
        let target = fx.target("c");

        fx.publish(&vol.volume_id, &target).await.unwrap();
        fx.publish(&vol.volume_id, &target).await.unwrap();
        assert_eq!(fx.backend.mounts().find_by_volume(&vol.volume_id).await.len(), 1);

        fx.backend.unpublish_volume(&vol.volume_id, &target).await.unwrap();
        fx.backend.unpublish_volume(&vol.volume_id, &target).await.unwrap();

        let calls = fx.mounter.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("mount")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with("umount")).count(), 1);
    }

    #[tokio::test]
    async fn failed_mount_rolls_back() {
        let fx = Fixture::new();
        let vol = fx.create("flaky", GIB).await;
        let target = fx.target("d");

        fx.mounter.fail_mount.store(true, Ordering::SeqCst);
        let err = fx.publish(&vol.volume_id, &target).await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::Internal);
        assert_eq!(fx.backend.mounts().state(&target).await, None);
        assert!(!Path::new(&target).exists());

        fx.mounter.fail_mount.store(false, Ordering::SeqCst);
        fx.publish(&vol.volume_id, &target).await.unwrap();
        assert_eq!(fx.backend.mounts().state(&target).await, Some(MountState::Published));
    }

    #[tokio::test]
    async fn failed_mount_keeps_an_existing_target_dir() {
        let fx = Fixture::new();
        let vol = fx.create("precreated", GIB).await;
        let target = fx.target("kubelet-made");
        std::fs::create_dir_all(&target).unwrap();

        fx.mounter.fail_mount.store(true, Ordering::SeqCst);
        fx.publish(&vol.volume_id, &target).await.unwrap_err();
        assert!(Path::new(&target).is_dir());
    }

    #[tokio::test]
    async fn failed_unmount_keeps_the_mount() {
        let fx = Fixture::new();
        let vol = fx.create("sticky", GIB).await;
        let target = fx.target("e");
        fx.publish(&vol.volume_id, &target).await.unwrap();

        fx.mounter.fail_unmount.store(true, Ordering::SeqCst);
        let err = fx
            .backend
            .unpublish_volume(&vol.volume_id, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::UnmountFailed { .. }));
        assert_eq!(fx.backend.mounts().state(&target).await, Some(MountState::Published));
        assert!(fx.backend.delete_volume(&vol.volume_id).await.is_err());
    }

    #[tokio::test]
    async fn abandoned_publish_is_rolled_back() {
        let fx = Fixture::with_mounter(FakeMounter::slow(Duration::from_millis(200)));
        let vol = fx.create("slow", GIB).await;
        let target = fx.target("f");

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            fx.publish(&vol.volume_id, &target),
        )
        .await;
        assert!(attempt.is_err(), "publish should still be in flight");
        assert_eq!(fx.backend.mounts().state(&target).await, Some(MountState::Publishing));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.backend.mounts().state(&target).await, None);
        assert_eq!(fx.mounter.calls().last().unwrap(), &format!("umount {target}"));
        assert!(!Path::new(&target).exists());

        // Nothing references the volume any more.
        fx.backend.delete_volume(&vol.volume_id).await.unwrap();
    }

    #[tokio::test]
    async fn in_flight_publish_is_not_reported() {
        let fx = Arc::new(Fixture::with_mounter(FakeMounter::slow(Duration::from_millis(150))));
        let vol = fx.create("pending", GIB).await;
        let target = fx.target("h");

        let publish = {
            let fx = Arc::clone(&fx);
            let id = vol.volume_id.clone();
            let target = target.clone();
            tokio::spawn(async move { fx.publish(&id, &target).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fx.backend.mounts().state(&target).await, Some(MountState::Publishing));
        let during = fx.backend.controller_get_volume(&vol.volume_id).await.unwrap();
        assert!(during.published_node_ids.is_empty());

        publish.await.unwrap().unwrap();
        let after = fx.backend.controller_get_volume(&vol.volume_id).await.unwrap();
        assert_eq!(after.published_node_ids, ["test-node"]);
    }

    #[tokio::test]
    async fn concurrent_publish_to_one_target_fails_fast() {
        let fx = Arc::new(Fixture::with_mounter(FakeMounter::slow(Duration::from_millis(150))));
        let vol = fx.create("race", GIB).await;
        let target = fx.target("g");

        let first = {
            let fx = Arc::clone(&fx);
            let id = vol.volume_id.clone();
            let target = target.clone();
            tokio::spawn(async move { fx.publish(&id, &target).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = fx.publish(&vol.volume_id, &target).await;
        assert!(matches!(second, Err(CsiError::Aborted(_))));
        first.await.unwrap().unwrap();

        // Once settled, a retry is an idempotent success.
        fx.publish(&vol.volume_id, &target).await.unwrap();
    }

    #[tokio::test]
    async fn single_writer_volume_gets_one_writable_mount() {
        let fx = Fixture::new();
        let vol = fx.create("rwo", GIB).await;
        fx.publish(&vol.volume_id, &fx.target("w1")).await.unwrap();

        let second = fx.publish(&vol.volume_id, &fx.target("w2")).await;
        assert!(matches!(second, Err(CsiError::FailedPrecondition(_))));

        fx.backend
            .publish_volume(publish_request(&vol.volume_id, &fx.target("r1"), true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reader_only_volume_is_mounted_read_only() {
        let fx = Fixture::new();
        let vol = fx
            .backend
            .create_volume(create_request("rox", GIB, AccessMode::MultiNodeReaderOnly))
            .await
            .unwrap();
        let target = fx.target("ro");
        fx.publish(&vol.volume_id, &target).await.unwrap();

        assert!(fx.backend.mounts().get(&target).await.unwrap().read_only);
        assert!(fx.mounter.calls()[0].ends_with(" ro"));
    }

    #[tokio::test]
    async fn stats_add_up() {
        let fx = Fixture::new();
        let vol = fx.create("stats", GIB).await;
        let target = fx.target("h");
        fx.publish(&vol.volume_id, &target).await.unwrap();

        let stats = fx
            .backend
            .get_volume_stats(&vol.volume_id, &target)
            .await
            .unwrap();
        let bytes = stats.usage_in(UsageUnit::Bytes).unwrap();
        assert!(bytes.total > 0);
        assert_eq!(bytes.used + bytes.available, bytes.total);
        let inodes = stats.usage_in(UsageUnit::Inodes).unwrap();
        assert_eq!(inodes.used + inodes.available, inodes.total);

        let missing = fx
            .backend
            .get_volume_stats(&vol.volume_id, "/nonexistent/path/for/test")
            .await;
        assert!(matches!(missing, Err(CsiError::Internal(_))));
    }

    #[test]
    fn reserved_blocks_do_not_break_the_sum() {
        // 100 blocks, 10 free but only 5 available to unprivileged users.
        let stats = usage_from_counts(4096, 100, 5, 1000, 900);
        let bytes = stats.usage_in(UsageUnit::Bytes).unwrap();
        assert_eq!(bytes.total, 409_600);
        assert_eq!(bytes.available, 20_480);
        assert_eq!(bytes.used, 389_120);
        let inodes = stats.usage_in(UsageUnit::Inodes).unwrap();
        assert_eq!((inodes.total, inodes.available, inodes.used), (1000, 900, 100));
    }

    #[tokio::test]
    async fn node_expand_requires_a_published_mount() {
        let fx = Fixture::new();
        let vol = fx.create("nodegrow", GIB).await;
        let target = fx.target("i");
        let request = |bytes| NodeExpandVolumeRequest {
            volume_id: vol.volume_id.clone(),
            volume_path: target.clone(),
            capacity_range: Some(CapacityRange::required(bytes)),
        };

        let unmounted = fx.backend.expand_volume(request(2 * GIB)).await;
        assert!(matches!(unmounted, Err(CsiError::MountNotFound(_))));

        fx.publish(&vol.volume_id, &target).await.unwrap();
        fx.backend
            .controller_expand_volume(&vol.volume_id, Some(CapacityRange::required(2 * GIB)))
            .await
            .unwrap();
        assert_eq!(fx.backend.expand_volume(request(2 * GIB)).await.unwrap(), 2 * GIB);
        assert_eq!(fx.backend.expand_volume(request(GIB)).await.unwrap(), 2 * GIB);
    }

    #[tokio::test]
    async fn unknown_volume_is_not_found_everywhere() {
        let fx = Fixture::new();
        let vol = fx.create("gone", GIB).await;
        fx.backend.delete_volume(&vol.volume_id).await.unwrap();

        for id in [VolumeId::from("dfs-never-created"), vol.volume_id.clone()] {
            let is_not_found = |e: CsiError| e.code() == crate::error::Code::NotFound;
            assert!(is_not_found(fx.backend.controller_get_volume(&id).await.unwrap_err()));
            assert!(is_not_found(
                fx.backend
                    .controller_expand_volume(&id, Some(CapacityRange::required(GIB)))
                    .await
                    .unwrap_err()
            ));
            assert!(is_not_found(
                fx.backend
                    .validate_volume_capabilities(&id, &[VolumeCapability::default()])
                    .await
                    .unwrap_err()
            ));
            assert!(is_not_found(fx.publish(&id, &fx.target("nf")).await.unwrap_err()));
            assert!(is_not_found(
                fx.backend
                    .get_volume_stats(&id, fx.tmp.path().to_str().unwrap())
                    .await
                    .unwrap_err()
            ));
            assert!(is_not_found(
                fx.backend
                    .expand_volume(NodeExpandVolumeRequest {
                        volume_id: id.clone(),
                        volume_path: fx.target("nf"),
                        capacity_range: None,
                    })
                    .await
                    .unwrap_err()
            ));
        }
    }

    #[tokio::test]
    async fn validate_reports_unsupported_capabilities() {
        let fx = Fixture::new();
        let vol = fx
            .backend
            .create_volume(create_request("ro", GIB, AccessMode::SingleNodeReaderOnly))
            .await
            .unwrap();

        let ok = fx
            .backend
            .validate_volume_capabilities(
                &vol.volume_id,
                &[VolumeCapability::mount(AccessMode::SingleNodeReaderOnly)],
            )
            .await
            .unwrap();
        assert!(ok.confirmed.is_some());

        let writer = fx
            .backend
            .validate_volume_capabilities(&vol.volume_id, &[VolumeCapability::default()])
            .await
            .unwrap();
        assert!(writer.confirmed.is_none());
        assert!(!writer.message.is_empty());

        let block = fx
            .backend
            .validate_volume_capabilities(
                &vol.volume_id,
                &[VolumeCapability {
                    access_mode: AccessMode::SingleNodeReaderOnly,
                    access_type: AccessType::Block,
                }],
            )
            .await
            .unwrap();
        assert_eq!(block.message, "block access type is not supported");
    }

    #[tokio::test]
    async fn list_volumes_pages() {
        let fx = Fixture::new();
        for i in 0..3 {
            fx.create(&format!("list-{i}"), GIB).await;
        }
        let first = fx
            .backend
            .list_volumes(ListVolumesRequest {
                max_entries: 2,
                starting_token: None,
            })
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        let rest = fx
            .backend
            .list_volumes(ListVolumesRequest {
                max_entries: 2,
                starting_token: first.next_token,
            })
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert!(rest.next_token.is_none());
    }

    #[tokio::test]
    async fn snapshots_are_unimplemented() {
        let fx = Fixture::new();
        let err = fx
            .backend
            .create_snapshot(&VolumeId::from("v"), "snap")
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::Unimplemented);
        assert!(fx.backend.list_snapshots().await.is_err());
        assert!(fx.backend.delete_snapshot("snap").await.is_err());
    }

    #[tokio::test]
    async fn identity_and_node_info() {
        let fx = Fixture::new();
        let info = fx.backend.get_plugin_info().await.unwrap();
        assert_eq!(info.name, "dfs.csi.k8s.io");
        assert_eq!(
            fx.backend.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::ControllerService]
        );

        // Ready as soon as the store is prepared, before any volume exists.
        assert!(!fx.backend.probe().await.unwrap());
        fx.backend.init().await.unwrap();
        assert!(fx.backend.probe().await.unwrap());
        assert!(fx.backend.volumes().list().await.is_empty());

        let node = fx.backend.get_info().await.unwrap();
        assert_eq!(node.node_id, "test-node");
        assert_eq!(node.max_volumes_per_node, 256);
        assert_eq!(node.accessible_topology, Some(Topology::for_node("test-node")));
        assert_eq!(fx.backend.get_capacity().await.unwrap(), UNBOUNDED_CAPACITY);
    }
}
