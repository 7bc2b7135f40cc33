//! Storage backend implementations.
//!
//! A backend provides a concrete type that implements [`CsiIdentity`],
//! [`CsiController`], and [`CsiNode`].
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

pub mod dfs;

pub use dfs::DfsBackend;
