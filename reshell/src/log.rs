use crate::cli::LogFormat;
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Silent => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
        }
    }
}

/// Install the global subscriber.
///
/// With `log_file` set, events go to that file (truncated) instead of stderr,
/// which keeps them off a terminal owned by the interactive shell.
pub fn init_tracing(level: Level, format: LogFormat, log_file: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy();

    match log_file {
        Some(path) => {
            let file = Mutex::new(File::create(path)?);
            match format {
                LogFormat::Cli => tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(file))
                    .init(),
            }
        }
        None => {
            let ansi = io::stderr().is_terminal();
            match format {
                LogFormat::Cli => tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(io::stderr)
                            .with_ansi(ansi)
                            .with_target(false)
                            .without_time(),
                    )
                    .init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                    .init(),
            }
        }
    }
    Ok(())
}
