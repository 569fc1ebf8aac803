//! Two-stage cancellation.
//!
//! The first interrupt asks the orchestrator to drain: no new files are
//! dispatched, in-flight files finish their current transition. A second
//! interrupt exits immediately; any half-finished transition is left for
//! recovery on the next start.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Exit status used for a forced (second-interrupt) exit.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    interrupts: Arc<AtomicU32>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            interrupts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Stop dispatching new work.
    pub fn request_drain(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_draining(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a drain has been requested.
    pub async fn drained(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|draining| *draining).await;
    }

    /// Route Ctrl-C into this handle: first press drains, second exits.
    pub fn install_signal_handler(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                let n = shutdown.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    warn!("interrupt received; draining in-flight uploads (press Ctrl-C again to exit now)");
                    shutdown.request_drain();
                } else {
                    error!("second interrupt; exiting without waiting for in-flight uploads");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
