use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Cli,
    /// One JSON object per event.
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "reshell",
    color = clap::ColorChoice::Auto,
    version,
    about = "Interactive shell whose environment reloads when its inputs change."
)]
pub struct Cli {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Configuration file. Defaults to reshell.yaml in the current directory, if present."
    )]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Build once and exec the shell without watching for changes.")]
    pub no_reload: bool,

    #[arg(
        short,
        long,
        value_name = "PATH",
        action = clap::ArgAction::Append,
        help = "Watch an extra file. Can be repeated."
    )]
    pub watch: Vec<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "COMMAND",
        help = "Shell command printing the environment script on stdout."
    )]
    pub build: Option<String>,

    #[arg(long, value_name = "PATH", help = "Shell to launch. Defaults to bash on PATH.")]
    pub shell: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        env = "RESHELL_RELOAD_FILE",
        help = "Where reloaded environments are published for the shell to source."
    )]
    pub reload_file: Option<PathBuf>,

    #[arg(long, help = "Do not draw the status line.")]
    pub no_status_line: bool,

    #[arg(long, value_name = "SECS", help = "Timeout for each task run inside the shell.")]
    pub task_timeout: Option<u64>,

    #[arg(short, long, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        conflicts_with = "verbose",
        help = "Silence all logs."
    )]
    pub quiet: bool,

    #[arg(long, value_enum, default_value_t, help = "Format of log output.")]
    pub log_format: LogFormat,

    #[arg(
        long,
        value_name = "PATH",
        help = "Write logs to this file. Hot-reload mode defaults to a file in the state directory."
    )]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn log_level(&self) -> crate::log::Level {
        if self.quiet {
            crate::log::Level::Silent
        } else if self.verbose {
            crate::log::Level::Debug
        } else {
            crate::log::Level::Info
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Level;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_repeated_watch() {
        let cli = Cli::try_parse_from(["reshell", "-w", "a.nix", "--watch", "b.nix", "--no-reload"])
            .unwrap();
        assert_eq!(cli.watch, [PathBuf::from("a.nix"), PathBuf::from("b.nix")]);
        assert!(cli.no_reload);
        assert_eq!(cli.log_format, LogFormat::Cli);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["reshell", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_log_level() {
        let cli = Cli::try_parse_from(["reshell", "--verbose"]).unwrap();
        assert!(cli.log_level() == Level::Debug);
        let cli = Cli::try_parse_from(["reshell", "--quiet", "--log-format", "json"]).unwrap();
        assert!(cli.log_level() == Level::Silent);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
