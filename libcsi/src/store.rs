//! Backing-directory allocation in the distributed backend's namespace.
//!
//! Each volume owns one directory under the store root:
//!
//! ```text
//! <volume_root>/
//!   <volume-id>/     # the volume's data, bind-mounted into workloads
//! ```

use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::types::VolumeId;

/// Allocates and frees volume backing directories.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// One-time setup before the first request.
    async fn prepare(&self) -> Result<(), CsiError> {
        Ok(())
    }

    /// Create the backing directory for `volume_id` and return its path.
    async fn create(&self, volume_id: &VolumeId) -> Result<PathBuf, CsiError>;

    /// Remove a backing directory and everything in it.  Succeeds if it is
    /// already gone.
    async fn remove(&self, backing_path: &Path) -> Result<(), CsiError>;

    /// Whether the store is usable.
    async fn is_ready(&self) -> bool;
}

/// Store rooted at a directory on the node (typically a mount of the
/// distributed filesystem).
#[derive(Debug, Clone)]
pub struct LocalVolumeStore {
    root: PathBuf,
}

impl LocalVolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volume_dir(&self, volume_id: &VolumeId) -> PathBuf {
        self.root.join(volume_id.as_str())
    }
}

/// Create `dir` (and missing parents) with mode 0750.
async fn make_dir(dir: &Path) -> Result<(), CsiError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(0o750);
    builder
        .create(dir)
        .await
        .map_err(|e| CsiError::BackendError(format!("create dir {}: {e}", dir.display())))
}

/// DirBuilder's mode is filtered through the umask.
async fn restrict(dir: &Path) -> Result<(), CsiError> {
    tokio::fs::set_permissions(dir, Permissions::from_mode(0o750))
        .await
        .map_err(|e| CsiError::BackendError(format!("chmod {}: {e}", dir.display())))
}

#[async_trait]
impl VolumeStore for LocalVolumeStore {
    async fn prepare(&self) -> Result<(), CsiError> {
        if self.is_ready().await {
            return Ok(());
        }
        make_dir(&self.root).await?;
        restrict(&self.root).await?;
        info!(root = %self.root.display(), "volume root created");
        Ok(())
    }

    async fn create(&self, volume_id: &VolumeId) -> Result<PathBuf, CsiError> {
        let dir = self.volume_dir(volume_id);
        make_dir(&dir).await?;
        if let Err(e) = restrict(&dir).await {
            if let Err(undo) = tokio::fs::remove_dir_all(&dir).await {
                warn!(path = %dir.display(), error = %undo, "failed to remove backing directory");
            }
            return Err(e);
        }
        info!(path = %dir.display(), "backing directory created");
        Ok(dir)
    }

    async fn remove(&self, backing_path: &Path) -> Result<(), CsiError> {
        match tokio::fs::remove_dir_all(backing_path).await {
            Ok(()) => {
                info!(path = %backing_path.display(), "backing directory removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %backing_path.display(), "backing directory already gone");
                Ok(())
            }
            Err(e) => Err(CsiError::BackendError(format!(
                "remove dir {}: {e}",
                backing_path.display()
            ))),
        }
    }

    async fn is_ready(&self) -> bool {
        tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}
