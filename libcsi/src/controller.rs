//! CSI Controller service trait.
//!
//! The Controller service manages the volume lifecycle: creation, deletion,
//! expansion, capability validation, listing, and capacity queries.
//! Snapshots are not supported; the snapshot RPCs have default bodies that
//! answer [`CsiError::Unimplemented`].

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    CapacityRange, ControllerCapability, ControllerExpandVolumeResponse,
    ControllerGetVolumeResponse, ControllerPublishVolumeRequest, CreateVolumeRequest,
    ListVolumesRequest, ListVolumesResponse, ValidateVolumeCapabilitiesResponse, Volume,
    VolumeCapability, VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the live volume with the same name.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    ///
    /// Deleting an unknown volume succeeds; deleting a mounted one fails with
    /// [`CsiError::FailedPrecondition`].
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Detach a volume from a node.
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// List volumes known to this controller, one page at a time.
    async fn list_volumes(&self, req: ListVolumesRequest)
    -> Result<ListVolumesResponse, CsiError>;

    /// Return the available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    /// Advertise the controller RPCs this plugin implements.
    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    /// Grow a volume's logical capacity.  Capacity never shrinks.
    async fn controller_expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_range: Option<CapacityRange>,
    ) -> Result<ControllerExpandVolumeResponse, CsiError>;

    /// Describe a volume and where it is currently published.
    async fn controller_get_volume(
        &self,
        volume_id: &VolumeId,
    ) -> Result<ControllerGetVolumeResponse, CsiError>;

    async fn create_snapshot(
        &self,
        _source_volume_id: &VolumeId,
        _name: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("CreateSnapshot".to_owned()))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("DeleteSnapshot".to_owned()))
    }

    async fn list_snapshots(&self) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("ListSnapshots".to_owned()))
    }
}
