//! # libcsi: CSI volume plugin for a distributed filesystem
//!
//! `libcsi` implements the volume lifecycle half of the
//! [Container Storage Interface][csi]: it creates, publishes, unpublishes,
//! expands and deletes volumes that are directories in a distributed
//! filesystem namespace, bind-mounted into workloads on the node.  It follows
//! the RK8s conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes, and status codes. |
//! | [`config`] | [`PluginConfig`]: driver name, node id, volume root. |
//! | [`registry`] | Volume and Mount registries, the plugin's in-memory state. |
//! | [`mounter`] | [`Mounter`] executor: bind mount and unmount. |
//! | [`store`] | [`VolumeStore`]: backing-directory allocation. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume create/delete/expand. |
//! | [`node`] | [`CsiNode`] trait: publish, unpublish, stats, expand. |
//! | [`backend`] | [`DfsBackend`], implementing all three traits. |
//! | [`message`] | [`CsiMessage`] request/response protocol. |
//! | [`transport`] | Unix-socket / TCP client and server. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod message;
pub mod mounter;
pub mod node;
pub mod registry;
pub mod store;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::DfsBackend;
pub use config::PluginConfig;
pub use controller::CsiController;
pub use error::{Code, CsiError};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use mounter::{BindMounter, DryRunMounter, Mounter};
pub use node::CsiNode;
pub use store::{LocalVolumeStore, VolumeStore};
pub use transport::{CsiClient, CsiServer, Endpoint};
pub use types::*;
