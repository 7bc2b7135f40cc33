//! Command-line flags and their mapping onto [`PluginConfig`].

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libcsi::config::{DEFAULT_DRIVER_NAME, DEFAULT_MAX_VOLUMES_PER_NODE, DEFAULT_VOLUME_ROOT};
use libcsi::{Endpoint, PluginConfig};

/// CSI plugin that provisions volumes as directories of a distributed
/// filesystem and bind-mounts them into workloads.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Listen address, `unix://<path>` or `tcp://<host:port>`
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///tmp/csi.sock")]
    pub endpoint: String,

    /// Identifier of the node this plugin instance serves
    #[arg(long = "nodeid", env = "NODE_ID")]
    pub node_id: String,

    /// Name the plugin registers under
    #[arg(long, env = "DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    /// Directory of the distributed filesystem holding volume data
    #[arg(long, env = "VOLUME_ROOT", default_value = DEFAULT_VOLUME_ROOT)]
    pub volume_root: PathBuf,

    /// Volume limit advertised through NodeGetInfo
    #[arg(long, env = "MAX_VOLUMES_PER_NODE", default_value_t = DEFAULT_MAX_VOLUMES_PER_NODE)]
    pub max_volumes_per_node: u64,

    /// Log mount operations instead of performing them
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Log filter, e.g. `info` or `libcsi=debug,info`
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn endpoint(&self) -> Result<Endpoint> {
        self.endpoint
            .parse()
            .with_context(|| format!("--endpoint {:?}", self.endpoint))
    }

    pub fn plugin_config(&self) -> Result<PluginConfig> {
        let mut config = PluginConfig::new(self.node_id.clone());
        config.driver_name = self.driver_name.clone();
        config.volume_root = self.volume_root.clone();
        config.max_volumes_per_node = self.max_volumes_per_node;
        config.validate().context("invalid plugin configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let argv = ["dfs-csi"].iter().chain(extra).copied();
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let args = parse(&[
            "--nodeid",
            "node-7",
            "--endpoint",
            "tcp://0.0.0.0:10000",
            "--volume-root",
            "/mnt/dfs/volumes",
            "--max-volumes-per-node",
            "8",
        ]);
        assert_eq!(args.endpoint().unwrap(), Endpoint::Tcp("0.0.0.0:10000".into()));

        let config = args.plugin_config().unwrap();
        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.volume_root, PathBuf::from("/mnt/dfs/volumes"));
        assert_eq!(config.max_volumes_per_node, 8);
        assert_eq!(config.driver_name, DEFAULT_DRIVER_NAME);
    }

    #[test]
    fn blank_node_id_is_rejected() {
        let args = parse(&["--nodeid", " "]);
        assert!(args.plugin_config().is_err());
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let args = parse(&["--nodeid", "n", "--endpoint", "/tmp/csi.sock"]);
        assert!(args.endpoint().is_err());
    }
}
