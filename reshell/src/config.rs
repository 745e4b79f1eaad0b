//! `reshell.yaml` and how it combines with the command line.

use crate::cli::Cli;
use miette::{IntoDiagnostic, Result, WrapErr, bail};
use reshell_shell::DEFAULT_TASK_TIMEOUT;
use reshell_tasks::TaskConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "reshell.yaml";

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub build: Option<String>,
    pub watch: Vec<PathBuf>,
    pub shell: Option<PathBuf>,
    pub reload: Option<bool>,
    pub status_line: Option<bool>,
    pub task_timeout_secs: Option<u64>,
    pub tasks: Vec<TaskConfig>,
}

impl FileConfig {
    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).into_diagnostic()
    }

    /// Load the explicitly named file, or `reshell.yaml` in `cwd` if it exists.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<(Self, Option<PathBuf>)> {
        let path = match explicit {
            Some(path) => {
                let path = cwd.join(path);
                if !path.exists() {
                    bail!("Config file {} does not exist", path.display());
                }
                path
            }
            None => {
                let path = cwd.join(DEFAULT_CONFIG_FILE);
                if !path.exists() {
                    return Ok((Self::default(), None));
                }
                path
            }
        };
        let contents = std::fs::read_to_string(&path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        let config = Self::parse(&contents)
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
        Ok((config, Some(path)))
    }
}

/// Effective settings after applying command line > config file > default.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cwd: PathBuf,
    pub build: String,
    /// Base watch set; includes the config file itself when one was loaded.
    pub watch: Vec<PathBuf>,
    pub shell: PathBuf,
    pub reload: bool,
    pub status_line: bool,
    pub task_timeout: Duration,
    pub reload_file: Option<PathBuf>,
    pub tasks: Vec<TaskConfig>,
}

impl Settings {
    pub fn resolve(
        cli: &Cli,
        file: FileConfig,
        config_path: Option<PathBuf>,
        cwd: PathBuf,
    ) -> Result<Self> {
        let shell = match cli.shell.clone().or(file.shell) {
            Some(shell) => shell,
            None => which::which("bash")
                .into_diagnostic()
                .wrap_err("Could not find bash on PATH; pass --shell")?,
        };

        let mut watch: Vec<PathBuf> = config_path.into_iter().collect();
        for path in file.watch.into_iter().chain(cli.watch.iter().cloned()) {
            let path = cwd.join(path);
            if !watch.contains(&path) {
                watch.push(path);
            }
        }

        let task_timeout = cli
            .task_timeout
            .or(file.task_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TASK_TIMEOUT);

        let Some(build) = cli.build.clone().or(file.build) else {
            bail!("No build command: pass --build or set `build` in {DEFAULT_CONFIG_FILE}");
        };

        Ok(Self {
            build,
            watch,
            shell,
            reload: !cli.no_reload && file.reload.unwrap_or(true),
            status_line: !cli.no_status_line && file.status_line.unwrap_or(true),
            task_timeout,
            reload_file: cli.reload_file.as_ref().map(|p| cwd.join(p)),
            tasks: file.tasks,
            cwd,
        })
    }

    pub fn tasks_in_shell(&self) -> bool {
        self.reload && self.tasks.iter().any(|t| t.in_shell)
    }
}
