//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make a volume available to Pod containers:
//!
//! 1. **Stage**: prepare the volume on the node (nothing to do for a
//!    distributed backend that is already reachable everywhere).
//! 2. **Publish**: bind-mount the volume's backing directory onto the
//!    target path.
//! 3. **Unpublish**: remove the bind-mount.
//! 4. **Unstage**: undo staging.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    ///
    /// This is idempotent: calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume from the staging path.
    ///
    /// This is idempotent: calling it on an already-unstaged volume should
    /// succeed without error.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount its backing directory onto the target.
    ///
    /// This is idempotent: calling it again for the same volume and
    /// `target_path` should succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the target path.
    ///
    /// This is idempotent: an absent mount is success.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Filesystem usage (bytes and inodes) at `volume_path`.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Apply a controller-side expansion to a published volume and return
    /// the resulting capacity.
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError>;

    /// Advertise the node RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
