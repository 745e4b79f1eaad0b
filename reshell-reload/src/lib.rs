//! Hot-reload coordination for reshell.
//!
//! Watches the files an environment was built from, rebuilds it when they
//! change and hands the result to the live shell through the reload file.

mod artifact;
mod builder;
mod config;
pub mod coordinator;

pub use artifact::{ArtifactError, ArtifactStore};
pub use builder::{BuildContext, BuildError, BuildOutcome, BuildTrigger, ShellBuilder, ShellSpec};
pub use config::{Config, DEFAULT_RELOAD_POLL};
pub use coordinator::{CoordinatorError, ShellCoordinator};

pub use reshell_shell::{CommandBuilder, SessionCommand, SessionEvent};
