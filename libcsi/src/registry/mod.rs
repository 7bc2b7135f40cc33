//! In-memory registries shared by the Controller and Node services.
//!
//! # Lock order
//!
//! Each registry owns a single read-write lock.  An operation that needs both
//! (delete, get-volume, publish) acquires the [`VolumeRegistry`] lock first
//! and the [`MountRegistry`] lock second.  No code path takes them in the
//! opposite order.

pub mod mount;
pub mod volume;

pub use mount::{MountRecord, MountRegistry, MountState};
pub use volume::{
    CONTEXT_BACKING_PATH, NewVolume, VolumeReadGuard, VolumeRecord, VolumeRegistry,
    VolumeWriteGuard,
};
