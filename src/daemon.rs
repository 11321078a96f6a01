use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;

use crate::context::DaemonContext;
use crate::helpers;
use crate::persist;
use crate::pidfile;
use crate::record::{ManagedProcess, Status};
use crate::rpc;
use crate::sampler::Sampler;
use crate::signals;
use crate::supervisor::{self, SupervisorEvent};
use crate::table::{ProcessTable, RecordHandle};

/// Run the daemon to completion: load state, bind the control socket, start
/// the sampler and signal handlers, and block until a shutdown is requested.
///
/// Grounded on the teacher's `daemon::start`/`daemon::health` entry points
/// (pidfile bookkeeping, `globals::init`, logging banner), generalized from a
/// fork-and-detach daemonizer into a long-running async `main` since GoPM's
/// daemon is the re-exec target itself rather than a process the CLI
/// daemonizes on its behalf.
pub async fn run(config_path_override: Option<String>) -> anyhow::Result<()> {
    crate::globals::init();
    let config = match &config_path_override {
        Some(path) => crate::config::read_at(path),
        None => crate::config::read(),
    };

    let table = Arc::new(ProcessTable::new());
    let ctx = DaemonContext::new(table, config);

    let pid = std::process::id();
    pidfile::write(pid)?;
    log::info!("{} daemon starting (pid {pid})", *helpers::SUCCESS);

    for record in resurrect(&ctx).await {
        log::info!("resurrected '{}' (status {:?})", record.name, record.status);
    }

    let sock_path = global_placeholders::global!("gopm.sock");
    let listener = rpc::server::bind(&sock_path)?;
    set_socket_permissions(&sock_path);

    let server_ctx = ctx.clone();
    let server_task = tokio::spawn(async move { rpc::server::serve(listener, server_ctx).await });
    let sampler_task = tokio::spawn(sampler_loop(ctx.clone()));
    signals::install(ctx.clone());

    ctx.wait_for_shutdown().await;
    log::info!("{} daemon shutting down", *helpers::SUCCESS);

    shutdown(&ctx).await;
    let _ = server_task.await;
    let _ = sampler_task.await;

    if ctx.is_reboot() {
        reexec_self(config_path_override)?;
    }

    Ok(())
}

fn set_socket_permissions(path: &str) {
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        log::warn!("failed to set socket permissions on {path}: {err}");
    }
}

/// Re-exec the daemon binary in place for a `reboot` request, preserving the
/// `--config` override the caller started with, per SPEC_FULL §6's `reboot`
/// contract ("arranges re-persistence... so a subsequent daemon start
/// resurrects them").
fn reexec_self(config_path_override: Option<String>) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command.arg("--daemon");
    if let Some(path) = config_path_override {
        command.arg("--config").arg(path);
    }

    let err = command.exec();
    Err(anyhow::anyhow!("failed to re-exec daemon for reboot: {err}"))
}

/// Register a freshly started record and kick its supervisor off, per
/// SPEC_FULL §4.4 "Lifecycle" ("created by an RPC `start` call").
pub async fn spawn_new(ctx: &Arc<DaemonContext>, record: ManagedProcess) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = Arc::new(RecordHandle {
        id: record.id,
        events: tx,
        fields: AsyncMutex::new(record),
        current_writers: AsyncMutex::new(None),
    });
    ctx.table.insert(handle.clone()).await;
    tokio::spawn(supervisor::run(handle.clone(), ctx.table.clone(), rx));
    let _ = handle.events.send(SupervisorEvent::Start);
}

/// Re-read the dump file and register any record not already present in the
/// table, letting each supervisor's own autostart check (`status == online`)
/// decide whether to respawn it. Skips records already known to the table so
/// calling this again via the `resurrect` RPC while already running is a
/// no-op for records the daemon is already supervising.
pub async fn resurrect(ctx: &Arc<DaemonContext>) -> Vec<ManagedProcess> {
    let mut resurrected = Vec::new();

    for record in persist::read() {
        if ctx.table.by_id(record.id).await.is_some() {
            continue;
        }
        ctx.table.ensure_next_id_above(record.id).await;

        let snapshot = record.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(RecordHandle {
            id: record.id,
            events: tx,
            fields: AsyncMutex::new(record),
            current_writers: AsyncMutex::new(None),
        });
        ctx.table.insert(handle.clone()).await;
        tokio::spawn(supervisor::run(handle, ctx.table.clone(), rx));
        resurrected.push(snapshot);
    }

    resurrected
}

/// Ask a record's supervisor to stop and block until it has actually left
/// `online`, bounded by its `kill_timeout` plus a margin (SPEC_FULL §8
/// testable property 4). Safe to call on an already-stopped record.
pub async fn stop_and_wait(handle: &Arc<RecordHandle>) {
    let kill_timeout_ms = handle.fields.lock().await.restart_policy.kill_timeout_ms;
    let _ = handle.events.send(SupervisorEvent::Stop);
    wait_while_online(handle, kill_timeout_ms + 500).await;
}

/// Ask a record's supervisor to restart (stop then start, resetting
/// `restart_count`) and wait for it to come back `online`, bounded by
/// `kill_timeout + restart_delay` plus a margin.
pub async fn restart_and_wait(handle: &Arc<RecordHandle>) {
    let (kill_timeout_ms, restart_delay_ms) = {
        let fields = handle.fields.lock().await;
        (fields.restart_policy.kill_timeout_ms, fields.restart_policy.restart_delay_ms)
    };
    let _ = handle.events.send(SupervisorEvent::Restart);
    wait_until_online(handle, kill_timeout_ms + restart_delay_ms + 500).await;
}

async fn wait_while_online(handle: &Arc<RecordHandle>, timeout_ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let status = handle.fields.lock().await.status;
        if status != Status::Online || Instant::now() >= deadline {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_until_online(handle: &Arc<RecordHandle>, timeout_ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let status = handle.fields.lock().await.status;
        if status == Status::Online || Instant::now() >= deadline {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// Stop a record and remove it from the table, per SPEC_FULL §4.4
/// "Lifecycle" ("destroyed by `delete`, which first instructs the supervisor
/// to stop and then removes the entry"). Must wait for the stop to actually
/// land before telling the supervisor to shut down: a `Shutdown` event
/// delivered while the supervisor is still in its stop grace period is
/// silently dropped by the state machine, which would otherwise leak the
/// supervisor task forever.
pub async fn delete(ctx: &Arc<DaemonContext>, handle: Arc<RecordHandle>) {
    stop_and_wait(&handle).await;
    let _ = handle.events.send(SupervisorEvent::Shutdown);
    ctx.table.remove(handle.id).await;
    persist::write(&ctx.table.list().await);
}

/// Stop every managed record, persist final state, and tear down the
/// process-wide socket/PID files, per SPEC_FULL §4.8. For a `reboot`
/// request, records that were `online` just before shutdown are re-persisted
/// as `online` so the next `resurrect` brings them back.
pub async fn shutdown(ctx: &Arc<DaemonContext>) {
    let handles = ctx.table.all().await;

    let mut online_ids = HashSet::new();
    for handle in &handles {
        if handle.snapshot().await.status == Status::Online {
            online_ids.insert(handle.id);
        }
    }

    let mut tasks = Vec::with_capacity(handles.len());
    for handle in handles {
        tasks.push(tokio::spawn(async move { stop_and_wait(&handle).await }));
    }
    for task in tasks {
        let _ = task.await;
    }

    let mut records = ctx.table.list().await;
    if ctx.is_reboot() {
        for record in records.iter_mut() {
            if online_ids.contains(&record.id) {
                record.status = Status::Online;
                record.status_reason = None;
            }
        }
    }
    persist::write(&records);

    pidfile::remove();
    let _ = std::fs::remove_file(global_placeholders::global!("gopm.sock"));
}

/// Periodically sample CPU/RSS for every running record, synthesizing a
/// `Gone` event for any record the supervisor still believes `online` whose
/// pid has disappeared from `/proc` (SPEC_FULL §4.2).
pub async fn sampler_loop(ctx: Arc<DaemonContext>) {
    let mut sampler = Sampler::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for handle in ctx.table.all().await {
                    let (pid, status) = {
                        let fields = handle.fields.lock().await;
                        (fields.pid, fields.status)
                    };
                    if pid == 0 {
                        continue;
                    }

                    match sampler.sample(pid) {
                        Some(sample) => {
                            let mut fields = handle.fields.lock().await;
                            fields.cpu_percent = sample.cpu_percent;
                            fields.memory_rss_bytes = sample.memory_rss_bytes;
                        }
                        None if status == Status::Online => {
                            let _ = handle.events.send(SupervisorEvent::Gone);
                        }
                        None => {}
                    }
                }
            }
            _ = ctx.wait_for_shutdown() => break,
        }
    }
}
