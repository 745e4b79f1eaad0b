//! Progress output shown before the interactive shell takes the terminal.

use console::{Term, style};
use reshell_shell::{CHECKMARK, XMARK};
use reshell_tasks::{OutputCallback, TaskOutcome};
use tokio::sync::oneshot;

/// Owns stderr until the session is ready for the user.
pub struct Frontend {
    term: Term,
    verbose: bool,
}

impl Frontend {
    pub fn new(verbose: bool) -> Self {
        Self {
            term: Term::stderr(),
            verbose,
        }
    }

    pub fn building(&self, command: &str) {
        let _ = self.term.write_line(&format!(
            "{} {}",
            style("Building environment:").bold(),
            style(command).dim()
        ));
    }

    pub fn running_tasks(&self, count: usize) {
        if count > 0 {
            let _ = self
                .term
                .write_line(&format!("{} setup task(s)", style(format!("Running {count}")).bold()));
        }
    }

    /// One line per finished task. Failed tasks also show their stderr.
    pub fn report(&self, outcomes: &[TaskOutcome]) {
        for outcome in outcomes {
            if outcome.result.success {
                let _ = self
                    .term
                    .write_line(&format!("{} {}", style(CHECKMARK).green(), outcome.name));
                continue;
            }
            let reason = outcome.result.error.as_deref().unwrap_or("failed");
            let _ = self.term.write_line(&format!(
                "{} {} {}",
                style(XMARK).red(),
                outcome.name,
                style(reason).red()
            ));
            for line in &outcome.result.stderr_lines {
                let _ = self.term.write_line(&format!("    {}", style(line).dim()));
            }
        }
    }

    pub fn error(&self, message: &str) {
        let _ = self
            .term
            .write_line(&format!("{} {}", style(XMARK).red(), style(message).red()));
    }

    /// Wait for the session to finish setup, then give it the terminal.
    pub async fn hand_off(
        self,
        backend_done_rx: oneshot::Receiver<()>,
        terminal_ready_tx: oneshot::Sender<()>,
    ) {
        // A dropped sender means the session is gone; there is nothing to wait for.
        let _ = backend_done_rx.await;
        let _ = self.term.flush();
        tracing::debug!("frontend: releasing terminal");
        let _ = terminal_ready_tx.send(());
    }
}

impl OutputCallback for Frontend {
    fn on_stdout(&self, line: &str) {
        if self.verbose {
            let _ = self.term.write_line(&format!("  {}", style(line).dim()));
        }
    }

    fn on_stderr(&self, line: &str) {
        if self.verbose {
            let _ = self.term.write_line(&format!("  {}", style(line).yellow()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hand_off_releases_after_backend_done() {
        let (done_tx, done_rx) = oneshot::channel();
        let (ready_tx, mut ready_rx) = oneshot::channel();

        let handoff = tokio::spawn(Frontend::new(false).hand_off(done_rx, ready_tx));
        tokio::task::yield_now().await;
        assert!(ready_rx.try_recv().is_err());

        done_tx.send(()).unwrap();
        handoff.await.unwrap();
        ready_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_hand_off_when_session_is_gone() {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let (ready_tx, _ready_rx) = oneshot::channel();
        drop(done_tx);
        Frontend::new(false).hand_off(done_rx, ready_tx).await;
    }
}
