//! Mount Executor: the node-local capability that binds a volume's backing
//! directory onto a target path and undoes it.
//!
//! Implementations are synchronous because the underlying syscalls block;
//! callers run them on Tokio's blocking pool.

use std::path::Path;

use nix::errno::Errno;
use nix::mount::MsFlags;
use tracing::{debug, info, warn};

use crate::error::CsiError;

/// Performs mounts on behalf of the Node service.
pub trait Mounter: Send + Sync {
    /// Make `source` visible at `target`.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Remove whatever is mounted at `target`.  Succeeds if nothing is.
    fn unmount(&self, target: &Path) -> Result<(), CsiError>;
}

/// Bind mounts through `mount(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindMounter;

/// Translate textual mount options into flags applied on the remount pass.
/// Unknown options are returned so they can be logged.
fn remount_flags(options: &[String]) -> (MsFlags, Vec<&str>) {
    let mut flags = MsFlags::empty();
    let mut unknown = Vec::new();
    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "bind" | "defaults" => {}
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => unknown.push(other),
        }
    }
    (flags, unknown)
}

impl Mounter for BindMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let failed = |reason: String| CsiError::MountFailed {
            path: target.display().to_string(),
            reason,
        };

        let (extra, unknown) = remount_flags(options);
        if !unknown.is_empty() {
            debug!(target = %target.display(), ?unknown, "ignoring unsupported mount options");
        }

        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| failed(e.to_string()))?;

        // The kernel ignores most flags on the initial bind; a second
        // remount pass is required to apply them.
        if !extra.is_empty() {
            let remount = nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | extra,
                None::<&str>,
            );
            if let Err(e) = remount {
                if let Err(undo) = nix::mount::umount(target) {
                    warn!(target = %target.display(), error = %undo, "failed to undo bind mount");
                }
                return Err(failed(format!("remount with {extra:?}: {e}")));
            }
        }

        debug!(
            source = %source.display(),
            target = %target.display(),
            fs_type,
            "bind mount established",
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        match nix::mount::umount(target) {
            Ok(()) => Ok(()),
            // EINVAL: not a mount point; ENOENT: path already gone.
            Err(Errno::EINVAL | Errno::ENOENT) => {
                debug!(target = %target.display(), "nothing mounted, skipping umount");
                Ok(())
            }
            Err(e) => Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Logs mount requests without touching the host.  Used for unprivileged
/// test deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunMounter;

impl Mounter for DryRunMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        info!(
            source = %source.display(),
            target = %target.display(),
            fs_type,
            ?options,
            "dry-run: skipping mount",
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        info!(target = %target.display(), "dry-run: skipping umount");
        Ok(())
    }
}
