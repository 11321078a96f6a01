use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

use crate::config::structs::Config;
use crate::table::ProcessTable;

/// Everything an RPC handler or the daemon main loop needs that isn't scoped
/// to a single record: the table itself, the loaded config, daemon start
/// time (for `ping`), and the shutdown/reboot signal shared between the RPC
/// `kill`/`reboot` methods, the signal handlers, and the main loop.
///
/// Grounded on SPEC_FULL §9 "Global mutable state": "pass it to components
/// as an explicit dependency rather than relying on module-level singletons."
pub struct DaemonContext {
    pub table: Arc<ProcessTable>,
    pub config: Config,
    pub start_time: Instant,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
    reboot: AtomicBool,
}

impl DaemonContext {
    pub fn new(table: Arc<ProcessTable>, config: Config) -> Arc<Self> {
        Arc::new(DaemonContext {
            table,
            config,
            start_time: Instant::now(),
            shutdown: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
            reboot: AtomicBool::new(false),
        })
    }

    /// Called by the `kill`/`reboot` RPC handlers and by the signal handlers
    /// (SPEC_FULL §4.8). Idempotent: a second call only updates `reboot`.
    pub fn request_shutdown(&self, reboot: bool) {
        if reboot {
            self.reboot.store(true, Ordering::SeqCst);
        }
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn is_reboot(&self) -> bool {
        self.reboot.load(Ordering::SeqCst)
    }

    /// Resolves once `request_shutdown` has been called, even if that
    /// happened concurrently with this call registering to wait (uses
    /// `enable()` to avoid the missed-wakeup race `Notify` warns about).
    pub async fn wait_for_shutdown(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }
}
