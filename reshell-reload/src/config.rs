use std::path::PathBuf;
use std::time::Duration;

/// How often the coordinator checks whether the shell consumed the reload file.
pub const DEFAULT_RELOAD_POLL: Duration = Duration::from_millis(100);

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct Config {
    /// Files to watch before the first build reports its own inputs
    pub watch_files: Vec<PathBuf>,
    /// Path the live shell sources on reload
    pub reload_file: PathBuf,
    /// Interval for the reload-applied check
    pub reload_poll: Duration,
}

impl Config {
    pub fn new(watch_files: Vec<PathBuf>, reload_file: impl Into<PathBuf>) -> Self {
        Self {
            watch_files,
            reload_file: reload_file.into(),
            reload_poll: DEFAULT_RELOAD_POLL,
        }
    }
}
