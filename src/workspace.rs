//! Per-request temporary directories.
//!
//! Every batch gets its own directory under the configured root. Names come
//! from `tempfile`, so two concurrent requests can never share one, and the
//! directory is created private to the service user.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Prefix of every workspace directory; also used by the stale sweep.
pub const WORKSPACE_PREFIX: &str = "newtube-batch-";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh, empty, uniquely named directory.
    pub fn allocate(&self) -> Result<Workspace> {
        fs::create_dir_all(&self.root).map_err(|err| Error::workspace(&self.root, err))?;
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|err| Error::workspace(&self.root, err))?;
        let path = dir.keep();
        debug!(workspace = %path.display(), "allocated workspace");
        Ok(Workspace {
            path: Arc::from(path),
        })
    }

    /// Removes workspaces left behind by an earlier process, e.g. after a
    /// crash skipped the scheduled cleanup. Returns how many were removed.
    pub fn sweep_stale(&self, max_age: Duration) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match remove_tree(&entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(workspace = %entry.path().display(), error = %err, "could not sweep stale workspace");
                }
            }
        }

        if removed > 0 {
            info!(removed, root = %self.root.display(), "swept stale workspaces");
        }
        Ok(removed)
    }
}

/// Handle to one allocated workspace. Clones refer to the same directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    path: Arc<Path>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path for `file_name` inside the workspace. Only a single plain file
    /// name is accepted.
    pub fn target_path(&self, file_name: &str) -> Result<PathBuf> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.path.join(file_name)),
            _ => Err(Error::InvalidEntryName(file_name.to_owned())),
        }
    }

    /// Recursively deletes the directory. A directory that is already gone,
    /// fully or partially, is not an error.
    pub async fn release(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(workspace = %self.path.display(), "released workspace");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Synchronous variant for contexts without a runtime.
    pub fn release_blocking(&self) -> io::Result<()> {
        remove_tree(&self.path)
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
