//! Plugin configuration shared by the backend and the binary.

use std::path::PathBuf;

use crate::error::CsiError;
use crate::types::DEFAULT_CAPACITY_BYTES;

/// Name the plugin registers under.
pub const DEFAULT_DRIVER_NAME: &str = "dfs.csi.k8s.io";

/// Directory under which volume backing directories are allocated.
pub const DEFAULT_VOLUME_ROOT: &str = "/var/lib/dfs/volumes";

/// Reported through `NodeGetInfo`.
pub const DEFAULT_MAX_VOLUMES_PER_NODE: u64 = 256;

/// Static settings of one plugin instance.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Plugin name in domain notation.
    pub driver_name: String,
    /// Version reported through `GetPluginInfo`.
    pub vendor_version: String,
    /// Identifier of the node this instance runs on.
    pub node_id: String,
    /// Root of the backend namespace used for backing directories.
    pub volume_root: PathBuf,
    /// Capacity given to volumes created without a size.
    pub default_capacity_bytes: u64,
    pub max_volumes_per_node: u64,
}

impl PluginConfig {
    /// Defaults for everything except the node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: node_id.into(),
            volume_root: PathBuf::from(DEFAULT_VOLUME_ROOT),
            default_capacity_bytes: DEFAULT_CAPACITY_BYTES,
            max_volumes_per_node: DEFAULT_MAX_VOLUMES_PER_NODE,
        }
    }

    /// Reject settings an orchestrator would refuse.
    ///
    /// The driver name must be at most 63 characters, start and end with an
    /// alphanumeric character, and contain only alphanumerics, `-` and `.`.
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.node_id.trim().is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }

        let name = self.driver_name.as_str();
        let edges_ok = name
            .chars()
            .next()
            .zip(name.chars().last())
            .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
        let body_ok = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if name.len() > 63 || !edges_ok || !body_ok {
            return Err(CsiError::InvalidArgument(format!(
                "invalid driver name {name:?}"
            )));
        }

        if self.volume_root.as_os_str().is_empty() {
            return Err(CsiError::InvalidArgument("volume root is required".into()));
        }
        Ok(())
    }
}
