//! Process shutdown coordination
//!
//! Pages are assumed non-recoverable: when one closes underneath us the
//! whole process drains and exits. The controller is trigger-once; the
//! first trigger wins and every subscriber observes it. The exit sequence
//! arms a 12 s hard-kill timer on a plain OS thread, then attempts to
//! snapshot browser session state within 10 s. A failed save does not
//! cancel the kill.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, warn};

/// Hard-kill delay once shutdown starts
const KILL_AFTER: Duration = Duration::from_secs(12);

/// Budget for the final session-state save
const SAVE_BUDGET: Duration = Duration::from_secs(10);

/// Trigger-once shutdown signal shared across subsystems
#[derive(Debug, Clone)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Returns true for the first caller only
    pub fn trigger(&self) -> bool {
        let first = !self.triggered.swap(true, Ordering::SeqCst);
        if first {
            warn!("shutdown triggered");
            self.tx.send_replace(true);
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been triggered
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Drain sequence run after [`Shutdown::trigger`]: arm the kill timer,
/// attempt the bounded save, exit.
pub async fn drain_and_exit(pool: &crate::browser::SessionPool) -> ! {
    warn!("shutting down now....");
    std::thread::spawn(|| {
        std::thread::sleep(KILL_AFTER);
        error!("shutdown wait exceeded, killing process");
        std::process::exit(70);
    });

    match tokio::time::timeout(SAVE_BUDGET, pool.save()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("final session save failed: {e:#}"),
        Err(_) => error!("final session save exceeded {SAVE_BUDGET:?}"),
    }
    std::process::exit(0);
}
