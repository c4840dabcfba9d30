//! Signal handling for the session service
//!
//! - SIGTERM/SIGINT: finalize every machine and exit
//! - SIGHUP: reload the settings file
//! - SIGUSR1: dump the registry to the log

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// Signals the service reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSignal {
    /// SIGTERM
    Term,
    /// SIGINT (Ctrl+C)
    Int,
    /// SIGHUP - reload settings
    Hup,
    /// SIGUSR1 - dump registry
    Usr1,
}

impl ServiceSignal {
    pub fn is_termination(&self) -> bool {
        matches!(self, Self::Term | Self::Int)
    }
}

pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
    sigusr1: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            sigusr1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> ServiceSignal {
        tokio::select! {
            _ = self.sigterm.recv() => ServiceSignal::Term,
            _ = self.sigint.recv() => ServiceSignal::Int,
            _ = self.sighup.recv() => ServiceSignal::Hup,
            _ = self.sigusr1.recv() => ServiceSignal::Usr1,
        }
    }

    /// Spawn a task that forwards signals to a channel
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<ServiceSignal> {
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            loop {
                let sig = self.wait().await;
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });

        rx
    }
}
