use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::log_writer::RotatingWriter;
use crate::persist;
use crate::policy::{self, Decision};
use crate::record::Status;
use crate::table::{ProcessTable, RecordHandle};

/// Everything pushed onto a supervisor's own FIFO queue: RPC-triggered
/// requests, the dedicated reap task's notification, and the sampler's
/// "gone" signal, per SPEC_FULL §4.3's implementation note.
#[derive(Debug)]
pub enum SupervisorEvent {
    Start,
    Stop,
    Restart,
    ChildExited(i32),
    Gone,
    Shutdown,
}

struct RunningChild {
    pid: u32,
    started_at: Instant,
    out_writer: Arc<RotatingWriter>,
    err_writer: Arc<RotatingWriter>,
}

/// Internal supervisor state, distinct from the persisted [`Status`] exposed
/// to RPC clients: `Idle` covers both `Stopped` and `Errored`, `Running`
/// covers `Online`, `Stopping` is the grace period after a stop/restart/
/// shutdown request, and `Delaying` is the cancellable restart-delay sleep.
enum Phase {
    Idle,
    Running(RunningChild),
    Stopping { child: RunningChild, then_restart: bool },
    Delaying { delay_ms: u64 },
}

/// Run one record's supervisor to completion. Returns only when the event
/// channel closes or a `Shutdown` event is handled.
///
/// Grounded on the teacher's spawn/stop primitives (`process::process_run`,
/// `process::process_stop`, `nix::kill`) and on
/// `examples/other_examples/24e211c3_jdx-pitchfork__src-supervisor-mod.rs.rs`'s
/// task-per-child shape; the teacher's own poll loop (`restart_process`,
/// ticking once per `daemon.interval`) is replaced outright since it cannot
/// offer cancellable restart-delay sleeps or FIFO-ordered per-record events.
pub async fn run(
    handle: Arc<RecordHandle>,
    table: Arc<ProcessTable>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    let autostart = matches!(handle.fields.lock().await.status, Status::Online);
    let mut phase = if autostart {
        Phase::Delaying { delay_ms: 0 }
    } else {
        Phase::Idle
    };

    loop {
        phase = match phase {
            Phase::Idle => match events.recv().await {
                None | Some(SupervisorEvent::Shutdown) => break,
                Some(SupervisorEvent::Start) | Some(SupervisorEvent::Restart) => {
                    Phase::Delaying { delay_ms: 0 }
                }
                Some(SupervisorEvent::Stop) => Phase::Idle,
                Some(SupervisorEvent::ChildExited(_)) | Some(SupervisorEvent::Gone) => Phase::Idle,
            },

            Phase::Delaying { delay_ms } => {
                tokio::select! {
                    _ = sleep(Duration::from_millis(delay_ms)) => {
                        match spawn_and_record(&handle, &table).await {
                            Some(child) => Phase::Running(child),
                            None => next_phase_after_spawn_failure(&handle, &table).await,
                        }
                    }
                    event = events.recv() => match event {
                        None => break,
                        Some(SupervisorEvent::Shutdown) => {
                            handle.fields.lock().await.status = Status::Stopped;
                            persist::write(&table.list().await);
                            break;
                        }
                        Some(SupervisorEvent::Stop) => {
                            handle.fields.lock().await.status = Status::Stopped;
                            persist::write(&table.list().await);
                            Phase::Idle
                        }
                        _ => Phase::Delaying { delay_ms },
                    },
                }
            }

            Phase::Running(child) => match events.recv().await {
                None | Some(SupervisorEvent::Shutdown) => {
                    let kill_signal = handle.fields.lock().await.restart_policy.kill_signal;
                    send_signal(child.pid, kill_signal);
                    Phase::Stopping { child, then_restart: false }
                }
                Some(SupervisorEvent::Stop) => {
                    let kill_signal = handle.fields.lock().await.restart_policy.kill_signal;
                    send_signal(child.pid, kill_signal);
                    Phase::Stopping { child, then_restart: false }
                }
                Some(SupervisorEvent::Restart) => {
                    let kill_signal = handle.fields.lock().await.restart_policy.kill_signal;
                    send_signal(child.pid, kill_signal);
                    Phase::Stopping { child, then_restart: true }
                }
                Some(SupervisorEvent::Start) => Phase::Running(child),
                Some(SupervisorEvent::Gone) => {
                    finish_run(&handle, &table, &child, false, Some(-1)).await
                }
                Some(SupervisorEvent::ChildExited(code)) => {
                    finish_run(&handle, &table, &child, false, Some(code)).await
                }
            },

            Phase::Stopping { child, then_restart } => {
                let kill_timeout_ms = handle.fields.lock().await.restart_policy.kill_timeout_ms;
                tokio::select! {
                    event = events.recv() => match event {
                        Some(SupervisorEvent::ChildExited(code)) if then_restart => {
                            restart_after_explicit_request(&handle, &table, &child, Some(code)).await
                        }
                        Some(SupervisorEvent::Gone) if then_restart => {
                            restart_after_explicit_request(&handle, &table, &child, Some(-1)).await
                        }
                        Some(SupervisorEvent::ChildExited(code)) => {
                            finish_run(&handle, &table, &child, true, Some(code)).await
                        }
                        Some(SupervisorEvent::Gone) => {
                            finish_run(&handle, &table, &child, true, Some(-1)).await
                        }
                        // A start/restart arriving while we're still waiting
                        // on the reap is queued by upgrading then_restart, so
                        // it survives even a plain stop: never a lost start.
                        Some(SupervisorEvent::Start) | Some(SupervisorEvent::Restart) => {
                            Phase::Stopping { child, then_restart: true }
                        }
                        None => break,
                        // Stop is idempotent; we're already stopping.
                        _ => Phase::Stopping { child, then_restart },
                    },
                    _ = sleep(Duration::from_millis(kill_timeout_ms)) => {
                        send_signal(child.pid, libc::SIGKILL);
                        Phase::Stopping { child, then_restart }
                    }
                }
            }
        };
    }
}

fn send_signal(pid: u32, signal: i32) {
    if let Ok(signal) = Signal::try_from(signal) {
        let _ = killpg(Pid::from_raw(pid as i32), signal);
    }
}

/// Apply the reap outcome for a child that exited on its own (not via the
/// `Stopping` grace period): record exit code, decide next phase.
async fn finish_run(
    handle: &Arc<RecordHandle>,
    table: &Arc<ProcessTable>,
    child: &RunningChild,
    explicit_stop: bool,
    exit_code: Option<i32>,
) -> Phase {
    child.out_writer.close();
    child.err_writer.close();
    *handle.current_writers.lock().await = None;

    let uptime_ms = child.started_at.elapsed().as_millis() as u64;
    let exit_code = exit_code.unwrap_or(-1);

    let decision = {
        let mut fields = handle.fields.lock().await;
        fields.last_exit_code = Some(exit_code);
        fields.pid = 0;
        policy::decide(
            &fields.restart_policy,
            exit_code,
            uptime_ms,
            fields.restart_count,
            explicit_stop,
        )
    };

    apply_decision(handle, table, decision).await
}

/// Reap outcome for an explicit `restart` request: unlike [`finish_run`], the
/// restart decision is unconditional — it bypasses `auto_restart` entirely,
/// per SPEC_FULL §4.3's public contract ("`request_restart()`: equivalent to
/// stop then start; resets `restart_count` to 0 on successful re-entry").
async fn restart_after_explicit_request(
    handle: &Arc<RecordHandle>,
    table: &Arc<ProcessTable>,
    child: &RunningChild,
    exit_code: Option<i32>,
) -> Phase {
    child.out_writer.close();
    child.err_writer.close();
    *handle.current_writers.lock().await = None;

    {
        let mut fields = handle.fields.lock().await;
        fields.last_exit_code = Some(exit_code.unwrap_or(-1));
        fields.pid = 0;
        fields.restart_count = 0;
    }
    persist::write(&table.list().await);
    Phase::Delaying { delay_ms: 0 }
}

async fn next_phase_after_spawn_failure(handle: &Arc<RecordHandle>, table: &Arc<ProcessTable>) -> Phase {
    let decision = {
        let mut fields = handle.fields.lock().await;
        fields.last_exit_code = Some(-1);
        policy::decide(&fields.restart_policy, -1, 0, fields.restart_count, false)
    };
    apply_decision(handle, table, decision).await
}

async fn apply_decision(handle: &Arc<RecordHandle>, table: &Arc<ProcessTable>, decision: Decision) -> Phase {
    let next = {
        let mut fields = handle.fields.lock().await;
        match &decision {
            Decision::Stop => {
                fields.status = Status::Stopped;
                fields.status_reason = None;
                Phase::Idle
            }
            Decision::GiveUp { reason } => {
                fields.status = Status::Errored;
                fields.status_reason = Some(reason.clone());
                Phase::Idle
            }
            Decision::Restart { delay_ms, restart_count } => {
                fields.restart_count = *restart_count;
                Phase::Delaying { delay_ms: *delay_ms }
            }
        }
    };
    persist::write(&table.list().await);
    next
}

/// Spawn the child, attach its stdout/stderr to rotating log writers via
/// forwarder tasks, and start the dedicated reap task.
///
/// Grounded on the teacher's `process::process_run` argv/cwd/env handling,
/// generalized to pipe child output through forwarder tasks into
/// [`RotatingWriter`] instead of a bare append-mode redirect, since rotation
/// requires GoPM (not the kernel) to own the write path.
async fn spawn_and_record(handle: &Arc<RecordHandle>, table: &Arc<ProcessTable>) -> Option<RunningChild> {
    let record = handle.fields.lock().await.clone();
    let argv = record.argv();
    let Some((program, args)) = argv.split_first() else {
        log::warn!("{}: empty command, cannot spawn", record.name);
        return None;
    };

    let out_writer = match RotatingWriter::new(&record.log_out_path, record.log_max_size_bytes, record.log_max_files) {
        Ok(writer) => Arc::new(writer),
        Err(err) => {
            log::warn!("{}: cannot open stdout log: {err}", record.name);
            return None;
        }
    };
    let err_writer = match RotatingWriter::new(&record.log_err_path, record.log_max_size_bytes, record.log_max_files) {
        Ok(writer) => Arc::new(writer),
        Err(err) => {
            log::warn!("{}: cannot open stderr log: {err}", record.name);
            return None;
        }
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&record.cwd)
        .envs(record.env.clone())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // New process group (pgid == child pid) so `stop` can signal the whole
    // tree without the daemon's own session being affected.
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            log::warn!("{}: spawn failed: {err}", record.name);
            return None;
        }
    };

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            log::warn!("{}: child exited before pid was observed", record.name);
            return None;
        }
    };

    if let Some(stdout) = child.stdout.take() {
        spawn_forwarder(stdout, out_writer.clone(), handle.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_forwarder(stderr, err_writer.clone(), handle.clone());
    }
    spawn_reaper(child, handle.events.clone());
    *handle.current_writers.lock().await = Some((out_writer.clone(), err_writer.clone()));

    {
        let mut fields = handle.fields.lock().await;
        fields.pid = pid;
        fields.status = Status::Online;
        fields.status_reason = None;
        fields.last_start = Some(chrono::Utc::now());
    }
    persist::write(&table.list().await);

    Some(RunningChild {
        pid,
        started_at: Instant::now(),
        out_writer,
        err_writer,
    })
}

/// Copy a child's stdout/stderr into its rotating log writer. Per SPEC_FULL
/// §7 "I/O errors on logs": a write failure never kills the child, but is
/// surfaced once as `status_reason = "log write failed"` on the record — the
/// writer itself enters a degraded state but keeps accepting further writes.
fn spawn_forwarder(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    writer: Arc<RotatingWriter>,
    handle: Arc<RecordHandle>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write(&buf[..n]).is_err() {
                        log::warn!("{}: log write failed", writer.path().display());
                        let mut fields = handle.fields.lock().await;
                        if fields.status_reason.is_none() {
                            fields.status_reason = Some("log write failed".to_string());
                        }
                    }
                }
            }
        }
    });
}

fn spawn_reaper(mut child: Child, events: mpsc::UnboundedSender<SupervisorEvent>) {
    tokio::spawn(async move {
        let exit_code = match child.wait().await {
            Ok(status) => exit_code_from_status(status),
            Err(_) => -1,
        };
        let _ = events.send(SupervisorEvent::ChildExited(exit_code));
    });
}

/// Low 8 bits of the OS exit status, or `128 + signum` for a signal-terminated
/// child, per SPEC_FULL §6 "Process exit semantics".
fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code & 0xff
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_clean_exit_is_masked_to_low_byte() {
        assert_eq!(exit_code_from_status(std::process::ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_from_status(std::process::ExitStatus::from_raw(2 << 8)), 2);
    }

    #[test]
    fn exit_code_signal_termination_is_128_plus_signum() {
        // Raw status for "terminated by signal 9" (low 7 bits = signal, no
        // core-dump bit, matching WIFSIGNALED encoding on Linux).
        assert_eq!(exit_code_from_status(std::process::ExitStatus::from_raw(9)), 137);
    }
}
