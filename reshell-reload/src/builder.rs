use portable_pty::CommandBuilder;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// What triggered a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTrigger {
    /// Initial shell spawn
    Initial,
    /// Watched files changed since the last build
    FilesChanged(Vec<PathBuf>),
}

/// Context passed to the builder on each build
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Current working directory
    pub cwd: PathBuf,
    /// What triggered this build
    pub trigger: BuildTrigger,
    /// Monotonic build number; 0 is the initial build
    pub generation: u64,
    /// Path the live shell sources on reload
    pub reload_file: PathBuf,
    /// Private path the new environment script is written to. The
    /// coordinator moves it to `reload_file` once the build is known to be
    /// current.
    pub staged_artifact: PathBuf,
    /// Cancelled when a newer change supersedes this build
    pub cancel: CancellationToken,
}

impl BuildContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write the environment script for this build.
    pub fn stage_artifact(&self, contents: &[u8]) -> Result<(), BuildError> {
        std::fs::write(&self.staged_artifact, contents).map_err(|e| {
            BuildError::new("failed to write environment script").with_details(format!(
                "{}: {}",
                self.staged_artifact.display(),
                e
            ))
        })
    }

    /// Path relative to the working directory, for display.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.cwd).unwrap_or(path)
    }
}

/// Error returned by shell builder
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BuildError {
    pub message: String,
    pub details: Option<String>,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn cancelled() -> Self {
        Self::new("build cancelled")
    }

    /// Message and details on separate lines.
    pub fn full_message(&self) -> String {
        match &self.details {
            Some(details) => format!("{}\n{}", self.message, details),
            None => self.message.clone(),
        }
    }
}

/// The interactive shell produced by the initial build.
#[derive(Debug)]
pub struct ShellSpec {
    pub command: CommandBuilder,
    /// Files the environment was computed from
    pub watch_paths: Vec<PathBuf>,
}

/// Result of one rebuild, as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success {
        artifact_path: PathBuf,
        new_watch_paths: Vec<PathBuf>,
    },
    Failure {
        message: String,
    },
}

/// Turns change triggers into environments. Implemented by the consumer.
///
/// Both methods run on the blocking pool and may take as long as they need,
/// but should poll [`BuildContext::is_cancelled`] and return early once it
/// is set.
pub trait ShellBuilder: Send + Sync {
    /// Produce the command that starts the interactive shell.
    fn build(&self, ctx: &BuildContext) -> Result<ShellSpec, BuildError>;

    /// Produce a new environment script with
    /// [`BuildContext::stage_artifact`] and return the files it depends on.
    fn build_reload_env(&self, ctx: &BuildContext) -> Result<Vec<PathBuf>, BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &Path) -> BuildContext {
        BuildContext {
            cwd: dir.to_path_buf(),
            trigger: BuildTrigger::Initial,
            generation: 0,
            reload_file: dir.join("reload.sh"),
            staged_artifact: dir.join(".reload.sh.0.tmp"),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_build_error_new() {
        let err = BuildError::new("test error");
        assert_eq!(err.message, "test error");
        assert!(err.details.is_none());
        assert_eq!(err.full_message(), "test error");
    }

    #[test]
    fn test_build_error_display_omits_details() {
        let err = BuildError::new("something failed").with_details("line 3");
        assert_eq!(format!("{}", err), "something failed");
        assert_eq!(err.full_message(), "something failed\nline 3");
    }

    #[test]
    fn test_stage_artifact_writes_staged_path() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        ctx.stage_artifact(b"export A=1\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(&ctx.staged_artifact).unwrap(),
            "export A=1\n"
        );
        assert!(!ctx.reload_file.exists());
    }

    #[test]
    fn test_stage_artifact_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());
        ctx.staged_artifact = dir.path().join("missing/staged.sh");
        let err = ctx.stage_artifact(b"x").unwrap_err();
        assert!(err.details.unwrap().contains("missing"));
    }

    #[test]
    fn test_cancellation_is_visible() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        assert!(!ctx.is_cancelled());
        ctx.cancel.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_relative_path() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let inside = dir.path().join("env.conf");
        assert_eq!(ctx.relative(&inside), Path::new("env.conf"));
        assert_eq!(ctx.relative(Path::new("/elsewhere")), Path::new("/elsewhere"));
    }
}
