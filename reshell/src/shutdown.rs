//! Signal-driven graceful shutdown.

use nix::sys::signal::{self as nix_signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Cancels a token on the first SIGINT, SIGTERM or SIGHUP and force-exits
/// on the second.
#[derive(Debug)]
pub struct Shutdown {
    token: CancellationToken,
    last_signal: AtomicI32,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            last_signal: AtomicI32::new(0),
        })
    }

    /// Install the signal listeners. Must be called inside the runtime.
    pub fn install_signals(self: &Arc<Self>) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => Signal::SIGINT,
                    _ = sigterm.recv() => Signal::SIGTERM,
                    _ = sighup.recv() => Signal::SIGHUP,
                };

                if shutdown.last_signal().is_some() {
                    tracing::info!("Received second signal, forcing exit...");
                    shutdown.exit_process();
                }

                tracing::info!("Received {:?}, shutting down gracefully...", received);
                shutdown
                    .last_signal
                    .store(received as i32, Ordering::Relaxed);
                shutdown.shutdown();
            }
        });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            i => Signal::try_from(i).ok(),
        }
    }

    /// Exit status a shell uses for death by the last signal.
    pub fn exit_code(&self) -> Option<u8> {
        self.last_signal().map(|s| 128u8.wrapping_add(s as u8))
    }

    /// Re-raise the last signal with its default handler.
    pub fn exit_process(&self) -> ! {
        let signal = self.last_signal().unwrap_or(Signal::SIGTERM);
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: restoring the default disposition has no handler to race with.
        unsafe {
            let _ = nix_signal::sigaction(signal, &action);
        }
        let _ = nix_signal::kill(unistd::getpid(), signal);
        std::process::exit(1);
    }
}
