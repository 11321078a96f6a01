use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use crate::context::DaemonContext;

/// Install SIGTERM/SIGINT handlers that drive the same shutdown path as an
/// RPC `kill`, per SPEC_FULL §4.8.
///
/// Grounded on
/// `examples/other_examples/24e211c3_jdx-pitchfork__src-supervisor-mod.rs.rs`'s
/// `signals()`, which races `SignalKind::terminate()`/`interrupt()` against the
/// rest of its supervisor loop the same way; GoPM only needs to notify
/// `DaemonContext` rather than forward the signal to child processes, since
/// each record's supervisor already owns its own child and escalation timer.
pub fn install(ctx: Arc<DaemonContext>) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                log::warn!("failed to install SIGTERM handler: {err}");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(int) => int,
            Err(err) => {
                log::warn!("failed to install SIGINT handler: {err}");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => log::info!("received SIGTERM, shutting down"),
            _ = int.recv() => log::info!("received SIGINT, shutting down"),
        }
        ctx.request_shutdown(false);
    });
}
