//! PTY (pseudo-terminal) management.
//!
//! [`Pty::spawn`] starts the shell on a fresh PTY and hands back a channel
//! fed by a dedicated reader thread. There is exactly one reader for the
//! lifetime of the PTY; the task runner and the interactive loop consume the
//! same channel one after the other.

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to create PTY: {0}")]
    Create(String),
    #[error("failed to spawn command: {0}")]
    Spawn(String),
    #[error("failed to clone reader: {0}")]
    CloneReader(String),
    #[error("failed to get writer: {0}")]
    Writer(String),
    #[error("failed to resize PTY: {0}")]
    Resize(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Output of the PTY reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyOutput {
    Data(Vec<u8>),
    /// The child side hung up or the read failed.
    Closed,
}

/// The shell's pseudo-terminal.
///
/// Dropping it kills the child and closes the master, which also ends the
/// reader thread.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

impl Pty {
    /// Spawn `cmd` on a new PTY of the given size.
    pub fn spawn(
        cmd: CommandBuilder,
        size: PtySize,
    ) -> Result<(Self, mpsc::Receiver<PtyOutput>), PtyError> {
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::Create(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // Only the child keeps the slave open, so EOF follows its exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::CloneReader(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Writer(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        std::thread::Builder::new()
            .name("reshell-pty-reader".into())
            .spawn(move || read_loop(reader, tx))?;

        Ok((
            Self {
                master: pair.master,
                child,
                writer,
            },
            rx,
        ))
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    pub fn resize(&self, size: PtySize) -> Result<(), PtyError> {
        self.master
            .resize(size)
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// Exit code of the child if it has exited.
    pub fn try_wait(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(status) => status.map(|s| s.exit_code()),
            Err(e) => {
                tracing::debug!("pty: try_wait failed: {}", e);
                None
            }
        }
    }

    /// Exit code of a child whose output just closed.
    ///
    /// The hangup usually arrives slightly before the process can be reaped.
    pub async fn exit_code(&mut self) -> Option<u32> {
        for _ in 0..20 {
            if let Some(code) = self.try_wait() {
                return Some(code);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    pub fn kill(&mut self) {
        if self.try_wait().is_some() {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("pty: kill failed: {}", e);
        }
        let _ = self.child.try_wait();
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.kill();
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<PtyOutput>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(PtyOutput::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the slave side is gone.
                tracing::trace!("pty: read ended: {}", e);
                break;
            }
        }
    }
    let _ = tx.blocking_send(PtyOutput::Closed);
}

/// Size of the controlling terminal, 80x24 when there is none.
pub fn get_terminal_size() -> PtySize {
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PtySize {
        PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<PtyOutput>) -> String {
        let mut out = Vec::new();
        while let Some(PtyOutput::Data(chunk)) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_pty_error_io_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "not found");
        let pty_err: PtyError = io_err.into();
        assert!(matches!(pty_err, PtyError::Io(_)));
        assert!(pty_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_get_terminal_size_returns_valid_size() {
        let size = get_terminal_size();
        assert!(size.cols >= 1);
        assert!(size.rows >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_output_then_closed() {
        let mut cmd = CommandBuilder::new("sh");
        cmd.args(["-c", "printf hello; exit 7"]);
        let (mut pty, mut rx) = Pty::spawn(cmd, small()).expect("spawn");

        let output = tokio::time::timeout(Duration::from_secs(10), collect(&mut rx))
            .await
            .expect("timeout");
        assert!(output.contains("hello"));
        assert_eq!(pty.exit_code().await, Some(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_reaches_child() {
        let mut cmd = CommandBuilder::new("sh");
        cmd.args(["-c", "read line; echo \"got:$line\""]);
        let (mut pty, mut rx) = Pty::spawn(cmd, small()).expect("spawn");
        pty.write_all(b"ping\n").expect("write");

        let output = tokio::time::timeout(Duration::from_secs(10), collect(&mut rx))
            .await
            .expect("timeout");
        assert!(output.contains("got:ping"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_kills_child_and_closes_reader() {
        let mut cmd = CommandBuilder::new("sh");
        cmd.args(["-c", "sleep 60"]);
        let (pty, mut rx) = Pty::spawn(cmd, small()).expect("spawn");
        drop(pty);

        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Some(PtyOutput::Closed) | None => break,
                    Some(PtyOutput::Data(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "reader thread should end after drop");
    }
}
