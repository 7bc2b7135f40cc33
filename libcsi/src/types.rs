//! Core CSI types: volumes, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and backend implementations.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted as JSON; field names are camelCase so that they
//! line up with the names orchestrators use for the same CSI fields.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::CsiError;

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Capacity allocated when a `CreateVolume` request does not ask for any.
pub const DEFAULT_CAPACITY_BYTES: u64 = GIB;

/// Sentinel reported by `GetCapacity`: the distributed backend exposes no
/// meaningful upper bound.  Kept within `i64` range for CSI compatibility.
pub const UNBOUNDED_CAPACITY: u64 = i64::MAX as u64;

/// Topology key under which a node advertises itself.
pub const TOPOLOGY_HOSTNAME_KEY: &str = "kubernetes.io/hostname";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    /// Read-write from a single node.
    SingleNodeWriter,
    /// Read-only from a single node.
    SingleNodeReaderOnly,
    /// Read-only from many nodes.
    MultiNodeReaderOnly,
    /// Readable from many nodes, writable from one.
    MultiNodeSingleWriter,
    /// Read-write from many nodes.
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Mounts of a reader-only volume are always forced read-only.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }

    /// At most one writable mount may exist at a time.
    pub fn is_single_writer(self) -> bool {
        matches!(self, Self::SingleNodeWriter | Self::MultiNodeSingleWriter)
    }
}

/// How the volume is presented to the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AccessType {
    /// A mounted filesystem.
    Mount {
        /// Filesystem type recorded for diagnostics (`"bind"` by default).
        #[serde(default = "default_fs_type")]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// A raw block device.  Never supported by this plugin.
    Block,
}

fn default_fs_type() -> String {
    "bind".to_owned()
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type.
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// Mount-type capability with the given access mode and default options.
    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            access_type: AccessType::Mount {
                fs_type: default_fs_type(),
                mount_flags: Vec::new(),
            },
        }
    }

    /// Whether the capability asks for a raw block device.
    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }

    /// Filesystem type of a mount capability.
    pub fn fs_type(&self) -> &str {
        match &self.access_type {
            AccessType::Mount { fs_type, .. } if !fs_type.is_empty() => fs_type,
            _ => "bind",
        }
    }

    /// Mount flags of a mount capability (empty for block).
    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount(AccessMode::SingleNodeWriter)
    }
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Requested capacity bounds.  Zero means "unspecified" for either field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    /// Minimum acceptable size in bytes.
    #[serde(default)]
    pub required_bytes: u64,
    /// Maximum acceptable size in bytes.
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    /// Range that only sets a lower bound.
    pub fn required(bytes: u64) -> Self {
        Self {
            required_bytes: bytes,
            limit_bytes: 0,
        }
    }

    /// Pick the size to allocate: the required size when set, otherwise
    /// `default_bytes` capped by a non-zero limit.
    pub fn resolve(&self, default_bytes: u64) -> Result<u64, CsiError> {
        if self.limit_bytes > 0 && self.required_bytes > self.limit_bytes {
            return Err(CsiError::InvalidArgument(format!(
                "required bytes {} exceed limit bytes {}",
                self.required_bytes, self.limit_bytes
            )));
        }
        if self.required_bytes > 0 {
            return Ok(self.required_bytes);
        }
        if self.limit_bytes > 0 {
            return Ok(default_bytes.min(self.limit_bytes));
        }
        Ok(default_bytes)
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Volume as reported to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints (e.g. node affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"kubernetes.io/hostname": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl Topology {
    /// Single-segment topology pinning to `node_id`.
    pub fn for_node(node_id: &str) -> Self {
        Self {
            segments: HashMap::from([(TOPOLOGY_HOSTNAME_KEY.to_owned(), node_id.to_owned())]),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    /// Caller-chosen name; the idempotency key.
    pub name: String,
    /// Desired capacity.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters forwarded into the volume context.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to attach a volume to a node (a no-op for this backend).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub read_only: bool,
}

/// Result of `ValidateVolumeCapabilities`.
///
/// Exactly one of `confirmed` / `message` is meaningful: when the capabilities
/// are supported they are echoed back in `confirmed`, otherwise `message`
/// explains which one is not.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVolumeCapabilitiesResponse {
    #[serde(default)]
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub message: String,
}

/// Result of `ControllerExpandVolume`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerExpandVolumeResponse {
    /// Capacity after the expansion.
    pub capacity_bytes: u64,
    /// The mounted filesystem still has to be grown by `NodeExpandVolume`.
    pub node_expansion_required: bool,
}

/// Result of `ControllerGetVolume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerGetVolumeResponse {
    pub volume: Volume,
    /// Nodes the volume is currently published to.
    #[serde(default)]
    pub published_node_ids: Vec<String>,
}

/// Paging parameters for `ListVolumes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesRequest {
    /// Maximum number of entries to return; zero returns everything.
    #[serde(default)]
    pub max_entries: u32,
    /// Token from a previous response's `next_token`.
    #[serde(default)]
    pub starting_token: Option<String>,
}

/// One page of `ListVolumes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    /// Present when more entries remain.
    #[serde(default)]
    pub next_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Node requests & responses
// ---------------------------------------------------------------------------

/// Request to stage a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a volume at a target path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Path the volume is bound to,
    /// e.g. `/var/lib/kubelet/pods/<pod-uid>/volumes/<vol-name>`.
    pub target_path: String,
    /// Staging path, when the orchestrator staged the volume first.
    #[serde(default)]
    pub staging_target_path: Option<String>,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to grow the filesystem of a published volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    pub volume_path: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

/// Unit of a [`VolumeUsage`] entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

/// Usage of one resource on a published volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeUsage {
    pub available: u64,
    pub total: u64,
    pub used: u64,
    pub unit: UsageUnit,
}

/// Result of `NodeGetVolumeStats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
}

impl VolumeStats {
    /// The usage entry reported in `unit`, if any.
    pub fn usage_in(&self, unit: UsageUnit) -> Option<&VolumeUsage> {
        self.usage.iter().find(|u| u.unit == unit)
    }
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    /// Plugin name, e.g. `"dfs.csi.k8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// RPCs the Controller service implements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    ExpandVolume,
    GetVolume,
}

/// RPCs the Node service implements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes_per_node: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
