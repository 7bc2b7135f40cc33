//! CSI protocol messages.
//!
//! [`CsiMessage`] is the payload of every frame exchanged between an
//! orchestrator-side [`CsiClient`](crate::transport::CsiClient) and the
//! plugin's [`CsiServer`](crate::transport::CsiServer).  It is serialized as
//! externally-tagged JSON, so the CSI method name is the tag:
//!
//! ```json
//! {"DeleteVolume":{"volumeId":"dfs-1b4e..."}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Request or response carried by one frame.
///
/// The client sends a *request* variant and the server replies with the
/// matching *response* variant, [`CsiMessage::Ok`] for RPCs without a
/// payload, or [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all_fields = "camelCase")]
pub enum CsiMessage {
    // ----- Identity requests -----------------------------------------------
    GetPluginInfo,
    GetPluginCapabilities,
    Probe,

    // ----- Controller requests ---------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume {
        volume_id: VolumeId,
    },
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume {
        volume_id: VolumeId,
        #[serde(default)]
        node_id: String,
    },
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        volume_capabilities: Vec<VolumeCapability>,
    },
    ListVolumes(ListVolumesRequest),
    GetCapacity,
    ControllerGetCapabilities,
    ControllerExpandVolume {
        volume_id: VolumeId,
        #[serde(default)]
        capacity_range: Option<CapacityRange>,
    },
    ControllerGetVolume {
        volume_id: VolumeId,
    },
    CreateSnapshot {
        source_volume_id: VolumeId,
        name: String,
    },
    DeleteSnapshot {
        snapshot_id: String,
    },
    ListSnapshots,

    // ----- Node requests ---------------------------------------------------
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeGetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeExpandVolume(NodeExpandVolumeRequest),
    NodeGetCapabilities,
    NodeGetInfo,

    // ----- Responses -------------------------------------------------------
    PluginInfo(PluginInfo),
    PluginCapabilities(Vec<PluginCapability>),
    ProbeResult {
        ready: bool,
    },
    /// A volume was created, or an existing one with the same name returned.
    VolumeCreated(Volume),
    Validation(ValidateVolumeCapabilitiesResponse),
    VolumeList(ListVolumesResponse),
    Capacity {
        available_capacity: u64,
    },
    ControllerCapabilities(Vec<ControllerCapability>),
    ControllerExpanded(ControllerExpandVolumeResponse),
    VolumeDescription(ControllerGetVolumeResponse),
    VolumeStats(VolumeStats),
    NodeExpanded {
        capacity_bytes: u64,
    },
    NodeCapabilities(Vec<NodeCapability>),
    NodeInfo(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// The RPC failed.
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this variant is something a server should dispatch.
    pub fn is_request(&self) -> bool {
        !matches!(
            self,
            Self::PluginInfo(_)
                | Self::PluginCapabilities(_)
                | Self::ProbeResult { .. }
                | Self::VolumeCreated(_)
                | Self::Validation(_)
                | Self::VolumeList(_)
                | Self::Capacity { .. }
                | Self::ControllerCapabilities(_)
                | Self::ControllerExpanded(_)
                | Self::VolumeDescription(_)
                | Self::VolumeStats(_)
                | Self::NodeExpanded { .. }
                | Self::NodeCapabilities(_)
                | Self::NodeInfo(_)
                | Self::Ok
                | Self::Error(_)
        )
    }

    /// Turn an [`Error`](Self::Error) response into `Err`.
    pub fn into_result(self) -> Result<Self, CsiError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::Probe => f.write_str("Probe"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume { volume_id } => write!(f, "DeleteVolume({volume_id})"),
            Self::ControllerPublishVolume(req) => {
                write!(f, "ControllerPublishVolume({}, node={})", req.volume_id, req.node_id)
            }
            Self::ControllerUnpublishVolume { volume_id, node_id } => {
                write!(f, "ControllerUnpublishVolume({volume_id}, node={node_id})")
            }
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({volume_id})")
            }
            Self::ListVolumes(req) => write!(f, "ListVolumes(max={})", req.max_entries),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::ControllerExpandVolume { volume_id, .. } => {
                write!(f, "ControllerExpandVolume({volume_id})")
            }
            Self::ControllerGetVolume { volume_id } => write!(f, "ControllerGetVolume({volume_id})"),
            Self::CreateSnapshot { name, .. } => write!(f, "CreateSnapshot(name={name})"),
            Self::DeleteSnapshot { snapshot_id } => write!(f, "DeleteSnapshot({snapshot_id})"),
            Self::ListSnapshots => f.write_str("ListSnapshots"),
            Self::NodeStageVolume(req) => write!(f, "NodeStageVolume({})", req.volume_id),
            Self::NodeUnstageVolume { volume_id, .. } => write!(f, "NodeUnstageVolume({volume_id})"),
            Self::NodePublishVolume(req) => {
                write!(f, "NodePublishVolume({} -> {})", req.volume_id, req.target_path)
            }
            Self::NodeUnpublishVolume {
                volume_id,
                target_path,
            } => write!(f, "NodeUnpublishVolume({volume_id} -> {target_path})"),
            Self::NodeGetVolumeStats { volume_id, .. } => {
                write!(f, "NodeGetVolumeStats({volume_id})")
            }
            Self::NodeExpandVolume(req) => write!(f, "NodeExpandVolume({})", req.volume_id),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::NodeGetInfo => f.write_str("NodeGetInfo"),
            Self::PluginInfo(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilities(caps) => write!(f, "PluginCapabilities(count={})", caps.len()),
            Self::ProbeResult { ready } => write!(f, "ProbeResult({ready})"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::Validation(res) => write!(f, "Validation(confirmed={})", res.confirmed.is_some()),
            Self::VolumeList(res) => write!(f, "VolumeList(count={})", res.entries.len()),
            Self::Capacity { available_capacity } => write!(f, "Capacity({available_capacity})"),
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::ControllerExpanded(res) => write!(f, "ControllerExpanded({})", res.capacity_bytes),
            Self::VolumeDescription(res) => write!(f, "VolumeDescription({})", res.volume.volume_id),
            Self::VolumeStats(stats) => write!(f, "VolumeStats(count={})", stats.usage.len()),
            Self::NodeExpanded { capacity_bytes } => write!(f, "NodeExpanded({capacity_bytes})"),
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::NodeInfo(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_name_is_the_tag() {
        let msg = CsiMessage::DeleteVolume {
            volume_id: "dfs-1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"DeleteVolume": {"volumeId": "dfs-1"}}));

        let json = serde_json::to_value(CsiMessage::Probe).unwrap();
        assert_eq!(json, serde_json::json!("Probe"));
    }

    #[test]
    fn decodes_orchestrator_field_names() {
        let raw = r#"{"CreateVolume":{
            "name":"pvc-1",
            "capacityRange":{"requiredBytes":2048},
            "volumeCapabilities":[{"accessMode":"SINGLE_NODE_WRITER","accessType":{"mount":{}}}]
        }}"#;
        let CsiMessage::CreateVolume(req) = serde_json::from_str(raw).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(req.name, "pvc-1");
        assert_eq!(req.capacity_range, Some(CapacityRange::required(2048)));
        assert_eq!(req.volume_capabilities[0].fs_type(), "bind");
    }

    #[test]
    fn error_keeps_its_code_across_the_wire() {
        let msg = CsiMessage::Error(CsiError::VolumeNotFound("vol-1".into()));
        let json = serde_json::to_string(&msg).unwrap();
        let de: CsiMessage = serde_json::from_str(&json).unwrap();
        let err = de.into_result().unwrap_err();
        assert_eq!(err.code(), crate::error::Code::NotFound);
    }

    #[test]
    fn requests_and_responses_are_told_apart() {
        assert!(CsiMessage::NodeGetInfo.is_request());
        assert!(
            CsiMessage::ListSnapshots.is_request(),
            "unsupported RPCs are still dispatched"
        );
        assert!(!CsiMessage::Ok.is_request());
        assert!(!CsiMessage::ProbeResult { ready: true }.is_request());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        let msg = CsiMessage::NodeUnpublishVolume {
            volume_id: "dfs-1".into(),
            target_path: "/mnt/a".into(),
        };
        assert_eq!(msg.to_string(), "NodeUnpublishVolume(dfs-1 -> /mnt/a)");
    }
}
