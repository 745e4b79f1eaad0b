//! Raw mode handling for the real terminal.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

fn is_tty_fd(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

/// Puts a terminal into raw mode and restores the saved settings on drop.
///
/// Off a terminal (tests, CI, piped stdin) the guard does nothing.
pub struct RawModeGuard {
    fd: RawFd,
    original: Option<libc::termios>,
}

impl RawModeGuard {
    /// Enter raw mode on stdin.
    pub fn new() -> io::Result<Self> {
        Self::for_fd(io::stdin().as_raw_fd())
    }

    pub fn for_fd(fd: RawFd) -> io::Result<Self> {
        if !is_tty_fd(fd) {
            return Ok(Self { fd, original: None });
        }

        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let original = termios;

        unsafe { libc::cfmakeraw(&mut termios) };
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::trace!("terminal: raw mode enabled on fd {}", fd);

        Ok(Self {
            fd,
            original: Some(original),
        })
    }

    pub fn is_active(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original {
            unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &original) };
            tracing::trace!("terminal: raw mode restored on fd {}", self.fd);
        }
    }
}
