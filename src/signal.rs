// Signal handling module
//
// Supported signals:
// - SIGTERM: Graceful shutdown
// - SIGINT:  Graceful shutdown (Ctrl+C)
// - SIGHUP:  Log the listener table

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info};

/// Signal handler state
#[derive(Debug, Default)]
pub struct SignalHandler {
    /// Shutdown signal (SIGTERM, SIGINT)
    pub shutdown: Notify,
    /// Status signal (SIGHUP)
    pub report: Notify,
    /// Whether shutdown has been requested
    pub shutdown_requested: AtomicBool,
}

impl SignalHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn request_shutdown(&self, name: &str) {
        info!(signal = name, "initiating graceful shutdown");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        // notify_one stores a permit if nobody is waiting yet
        self.shutdown.notify_one();
    }
}

/// Start signal handlers (Unix only)
///
/// | Signal  | Action                |
/// |---------|-----------------------|
/// | SIGTERM | Graceful stop         |
/// | SIGINT  | Graceful stop         |
/// | SIGHUP  | Log listening sockets |
#[cfg(unix)]
pub fn start_signal_handler(handler: Arc<SignalHandler>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let registered = (
            signal(SignalKind::hangup()),
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        );
        let (mut sighup, mut sigterm, mut sigint) = match registered {
            (Ok(hup), Ok(term), Ok(int)) => (hup, term, int),
            (hup, term, int) => {
                for err in [hup.err(), term.err(), int.err()].into_iter().flatten() {
                    error!("failed to register signal handler: {err}");
                }
                return;
            }
        };

        info!(pid = std::process::id(), "signal handlers registered (SIGHUP, SIGTERM, SIGINT)");

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("SIGHUP received");
                    handler.report.notify_one();
                }
                _ = sigterm.recv() => {
                    handler.request_shutdown("SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    handler.request_shutdown("SIGINT");
                    break;
                }
            }
        }
    });
}

/// Non-Unix fallback - only handles Ctrl+C
#[cfg(not(unix))]
pub fn start_signal_handler(handler: Arc<SignalHandler>) {
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            handler.request_shutdown("ctrl-c");
        }
    });
}
