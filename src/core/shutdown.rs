//! Shutdown coordination
//!
//! A single broadcast channel fans the shutdown request out to every read
//! loop and to the retry scheduler. Signal handlers feed the same channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Coordinates graceful shutdown across the engine's background tasks
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_requested: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            shutdown_tx,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to shutdown notifications
    ///
    /// Receivers created after shutdown was triggered miss the broadcast, so
    /// long-running tasks should also consult [`Self::is_shutdown_requested`].
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Route SIGINT/SIGTERM/SIGHUP/SIGQUIT (or Ctrl-C elsewhere) into this coordinator
    ///
    /// A second signal exits the process immediately with status 130.
    pub fn install_signal_handlers(&self) {
        setup_signal_handlers(self.shutdown_tx.clone(), self.shutdown_requested.clone());
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once shutdown is requested
///
/// Treats a closed or lagged channel as a shutdown request.
pub async fn wait_for_shutdown(rx: &mut broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

fn setup_signal_handlers(shutdown_tx: broadcast::Sender<()>, shutdown_requested: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }

        use std::sync::atomic::AtomicUsize;
        use tokio::signal::unix::{signal, SignalKind};
        let signal_count = Arc::new(AtomicUsize::new(0));
        let signals = [
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::hangup(),
            SignalKind::quit(),
        ];

        for kind in signals {
            let tx = shutdown_tx.clone();
            let requested = shutdown_requested.clone();
            let sig_ctr = signal_count.clone();

            tokio::spawn(async move {
                if let Ok(mut sig) = signal(kind) {
                    while sig.recv().await.is_some() {
                        let prev = sig_ctr.fetch_add(1, Ordering::AcqRel);
                        requested.store(true, Ordering::Release);
                        let _ = tx.send(());
                        if prev >= 1 {
                            log::warn!("Second shutdown signal received; exiting");
                            std::process::exit(130);
                        }
                        log::info!("Shutdown signal received; draining stream consumers");
                    }
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown_requested.store(true, Ordering::Release);
                let _ = shutdown_tx.send(());
            }
        });
    }
}
