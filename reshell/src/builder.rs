//! Builds environments by running a user-supplied shell command.
//!
//! The command prints a shell script on stdout; that script is what the
//! interactive shell sources. Extra inputs are reported by writing one path
//! per line to the file named by `RESHELL_WATCH_PATHS_FILE`.

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use reshell_reload::{
    BuildContext, BuildError, BuildTrigger, CommandBuilder, ShellBuilder, ShellSpec,
};
use reshell_shell::bash::{self, RELOAD_FILE_ENV, RcfileOptions};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const WATCH_PATHS_FILE_ENV: &str = "RESHELL_WATCH_PATHS_FILE";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What one run of the build command produced.
#[derive(Debug)]
pub struct BuildOutput {
    pub script: Vec<u8>,
    pub watch_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    command: String,
    shell: PathBuf,
    state_dir: PathBuf,
    tasks_in_shell: bool,
}

impl ScriptBuilder {
    pub fn new(
        command: impl Into<String>,
        shell: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        tasks_in_shell: bool,
    ) -> Self {
        Self {
            command: command.into(),
            shell: shell.into(),
            state_dir: state_dir.into(),
            tasks_in_shell,
        }
    }

    /// Run the build command in `cwd`, killing it if `cancel` fires.
    pub fn run(&self, cwd: &Path, cancel: &CancellationToken) -> Result<BuildOutput, BuildError> {
        let watch_file = tempfile::Builder::new()
            .prefix(".watch-")
            .tempfile_in(&self.state_dir)
            .map_err(|e| BuildError::new("failed to create watch paths file").with_details(e.to_string()))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(cwd)
            .env(WATCH_PATHS_FILE_ENV, watch_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                BuildError::new(format!("failed to run `{}`", self.command)).with_details(e.to_string())
            })?;

        let stdout = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf);
                buf
            })
        });
        let stderr = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let status = loop {
            if cancel.is_cancelled() {
                tracing::debug!("build: cancelled, killing `{}`", self.command);
                let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                let _ = child.wait();
                return Err(BuildError::cancelled());
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(BuildError::new("failed to wait for build command")
                        .with_details(e.to_string()));
                }
            }
        };

        let script = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let errors = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if !status.success() {
            let message = errors
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(|line| line.trim().to_string())
                .unwrap_or_else(|| format!("`{}` failed with {}", self.command, status));
            return Err(BuildError::new(message).with_details(errors));
        }

        let listed = std::fs::read_to_string(watch_file.path()).unwrap_or_default();
        let watch_paths = listed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| cwd.join(line))
            .collect();

        Ok(BuildOutput {
            script,
            watch_paths,
        })
    }

    /// Write the environment script and the rcfile sourcing it.
    pub fn write_rcfile(
        &self,
        script: &[u8],
        reload: bool,
        cleanup: bool,
    ) -> Result<PathBuf, BuildError> {
        let env_script = self.state_dir.join("env.sh");
        let rcfile = self.state_dir.join("rcfile.sh");
        let contents = bash::rcfile_content(&RcfileOptions {
            env_script: &env_script,
            reload,
            tasks_in_shell: reload && self.tasks_in_shell,
            cleanup_dir: cleanup.then_some(self.state_dir.as_path()),
        });
        std::fs::write(&env_script, script)
            .and_then(|()| std::fs::write(&rcfile, contents))
            .map_err(|e| {
                BuildError::new("failed to write shell init files").with_details(format!(
                    "{}: {}",
                    self.state_dir.display(),
                    e
                ))
            })?;
        Ok(rcfile)
    }

    /// Arguments for launching the shell with `rcfile`.
    pub fn shell_args(&self, rcfile: &Path) -> Vec<String> {
        bash::interactive_args(rcfile)
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }
}

impl ShellBuilder for ScriptBuilder {
    fn build(&self, ctx: &BuildContext) -> Result<ShellSpec, BuildError> {
        let output = self.run(&ctx.cwd, &ctx.cancel)?;
        let rcfile = self.write_rcfile(&output.script, true, false)?;

        let mut command = CommandBuilder::new(&self.shell);
        command.args(self.shell_args(&rcfile));
        command.cwd(&ctx.cwd);
        command.env(RELOAD_FILE_ENV, &ctx.reload_file);

        Ok(ShellSpec {
            command,
            watch_paths: output.watch_paths,
        })
    }

    fn build_reload_env(&self, ctx: &BuildContext) -> Result<Vec<PathBuf>, BuildError> {
        if let BuildTrigger::FilesChanged(paths) = &ctx.trigger {
            let changed: Vec<String> = paths
                .iter()
                .map(|p| ctx.relative(p).display().to_string())
                .collect();
            tracing::info!(
                "build {}: `{}` after changes to {}",
                ctx.generation,
                self.command,
                changed.join(", ")
            );
        }
        let output = self.run(&ctx.cwd, &ctx.cancel)?;
        if ctx.is_cancelled() {
            return Err(BuildError::cancelled());
        }
        ctx.stage_artifact(&output.script)?;
        Ok(output.watch_paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn builder(dir: &Path, command: &str) -> ScriptBuilder {
        ScriptBuilder::new(command, "bash", dir, false)
    }

    fn context(dir: &Path) -> BuildContext {
        BuildContext {
            cwd: dir.to_path_buf(),
            trigger: BuildTrigger::FilesChanged(vec![dir.join("env.conf")]),
            generation: 1,
            reload_file: dir.join("reload.sh"),
            staged_artifact: dir.join(".reload.sh.1.tmp"),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_run_captures_script_and_watch_paths() {
        let dir = TempDir::new().unwrap();
        let b = builder(
            dir.path(),
            "echo 'export A=1'; echo env.conf >> \"$RESHELL_WATCH_PATHS_FILE\"; echo '' >> \"$RESHELL_WATCH_PATHS_FILE\"",
        );
        let output = b.run(dir.path(), &CancellationToken::new()).unwrap();
        assert_eq!(output.script, b"export A=1\n");
        assert_eq!(output.watch_paths, [dir.path().join("env.conf")]);
    }

    #[test]
    fn test_failure_uses_last_stderr_line() {
        let dir = TempDir::new().unwrap();
        let b = builder(dir.path(), "echo progress >&2; echo 'syntax error' >&2; exit 2");
        let err = b.run(dir.path(), &CancellationToken::new()).unwrap_err();
        assert_eq!(err.message, "syntax error");
        assert_eq!(err.details.as_deref(), Some("progress\nsyntax error\n"));
    }

    #[test]
    fn test_silent_failure_names_command() {
        let dir = TempDir::new().unwrap();
        let err = builder(dir.path(), "exit 3")
            .run(dir.path(), &CancellationToken::new())
            .unwrap_err();
        assert!(err.message.starts_with("`exit 3` failed"), "{}", err.message);
    }

    #[test]
    fn test_cancel_kills_the_command() {
        let dir = TempDir::new().unwrap();
        let b = builder(dir.path(), "sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = b.run(dir.path(), &cancel).unwrap_err();
        assert_eq!(err.message, BuildError::cancelled().message);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_build_reload_env_stages_artifact() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let paths = builder(dir.path(), "echo 'export B=2'")
            .build_reload_env(&ctx)
            .unwrap();
        assert!(paths.is_empty());
        assert_eq!(
            std::fs::read_to_string(&ctx.staged_artifact).unwrap(),
            "export B=2\n"
        );
        assert!(!ctx.reload_file.exists());
    }

    #[test]
    fn test_build_writes_rcfile_and_command() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let spec = builder(dir.path(), "echo 'export C=3'").build(&ctx).unwrap();

        let rcfile = dir.path().join("rcfile.sh");
        let rc = std::fs::read_to_string(&rcfile).unwrap();
        assert!(rc.contains("__reshell_prompt_hook"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("env.sh")).unwrap(),
            "export C=3\n"
        );

        let argv: Vec<String> = spec
            .command
            .get_argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv[0], "bash");
        assert_eq!(argv[1..], bash::interactive_args(&rcfile));
        assert_eq!(
            spec.command.get_env(RELOAD_FILE_ENV),
            Some(ctx.reload_file.as_os_str())
        );
    }

    #[test]
    fn test_static_rcfile_cleans_up() {
        let dir = TempDir::new().unwrap();
        let rcfile = builder(dir.path(), "true")
            .write_rcfile(b"export D=4\n", false, true)
            .unwrap();
        let rc = std::fs::read_to_string(rcfile).unwrap();
        assert!(!rc.contains("__reshell_prompt_hook"));
        assert!(rc.contains("rm -rf --"));
    }
}
