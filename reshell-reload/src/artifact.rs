//! The reload file shared with the live shell.
//!
//! Builds write into a private staging path next to the reload file; the
//! coordinator then renames it into place. Staging in the same directory
//! keeps the rename atomic, so the shell either sees no file or a complete
//! one. Only the shell deletes the reload file.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("reload file {0} has no parent directory")]
    NoParent(PathBuf),
    #[error("failed to create directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("build produced no environment at {0}")]
    Missing(PathBuf),
    #[error("failed to publish {path}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    reload_file: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating the reload file's directory if needed.
    pub fn new(reload_file: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let reload_file = reload_file.into();
        let dir = reload_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .ok_or_else(|| ArtifactError::NoParent(reload_file.clone()))?;
        std::fs::create_dir_all(&dir).map_err(|source| ArtifactError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, reload_file })
    }

    pub fn reload_file(&self) -> &Path {
        &self.reload_file
    }

    /// Staging path for build `generation`.
    pub fn staging_path(&self, generation: u64) -> PathBuf {
        let name = self
            .reload_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reload".into());
        self.dir.join(format!(".{name}.{generation}.tmp"))
    }

    /// Move a staged script into place.
    pub fn publish(&self, staged: &Path) -> Result<(), ArtifactError> {
        if !staged.exists() {
            return Err(ArtifactError::Missing(staged.to_path_buf()));
        }
        std::fs::rename(staged, &self.reload_file).map_err(|source| ArtifactError::Publish {
            path: self.reload_file.clone(),
            source,
        })?;
        tracing::debug!("artifact: published {}", self.reload_file.display());
        Ok(())
    }

    /// Remove a staged script that will never be published.
    pub fn discard(&self, staged: &Path) {
        match std::fs::remove_file(staged) {
            Ok(()) => tracing::trace!("artifact: discarded {}", staged.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("artifact: failed to remove {}: {}", staged.display(), e),
        }
    }

    /// Whether a published script is still waiting for the shell.
    pub fn is_pending(&self) -> bool {
        self.reload_file.exists()
    }
}
