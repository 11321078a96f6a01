use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::DaemonContext;
use crate::daemon;
use crate::helpers;
use crate::persist;
use crate::record::{AutoRestart, ManagedProcess, RestartPolicy, Status, Target};
use crate::table::RecordHandle;

use super::framing::{Request, Response};

/// Dispatch one decoded [`Request`] against the shared daemon state, per the
/// method table in SPEC_FULL §4.6. Every branch returns a [`Response`]
/// instead of propagating an error: per-request failures are reported on the
/// wire (SPEC_FULL §7 "Request validation"), never by tearing down the
/// connection.
pub async fn handle(ctx: &Arc<DaemonContext>, request: Request) -> Response {
    match request.method.as_str() {
        "ping" => ping(ctx),
        "start" => start(ctx, request.params).await,
        "stop" => stop(ctx, request.params).await,
        "restart" => restart(ctx, request.params).await,
        "delete" => delete(ctx, request.params).await,
        "list" => list(ctx).await,
        "describe" => describe(ctx, request.params).await,
        "isrunning" => isrunning(ctx, request.params).await,
        "logs" => logs(ctx, request.params).await,
        "flush" => flush(ctx, request.params).await,
        "resurrect" => resurrect(ctx).await,
        "save" => save(ctx).await,
        "kill" => kill(ctx),
        "reboot" => reboot(ctx),
        other => Response::err(format!("unknown method '{other}'")),
    }
}

#[derive(Debug, Deserialize)]
struct TargetParams {
    target: String,
}

fn parse_target(params: Value) -> Result<Target, Response> {
    serde_json::from_value::<TargetParams>(params)
        .map(|p| Target::parse(&p.target))
        .map_err(|err| Response::err(format!("expected a 'target' field: {err}")))
}

fn record_json(record: &ManagedProcess) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

fn ping(ctx: &Arc<DaemonContext>) -> Response {
    let uptime = ctx.start_time.elapsed();
    Response::ok(json!({
        "pid": std::process::id(),
        "uptime_human": helpers::format_duration_ms(uptime.as_millis() as u64),
        "uptime_ms": uptime.as_millis() as u64,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct StartParams {
    command: String,
    name: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    interpreter: Option<String>,
    autorestart: Option<String>,
    max_restarts: Option<u32>,
    min_uptime: Option<String>,
    restart_delay: Option<String>,
    #[serde(default)]
    exp_backoff: bool,
    max_delay: Option<String>,
    kill_timeout: Option<String>,
    log_out: Option<String>,
    log_err: Option<String>,
    max_log_size: Option<String>,
    max_log_files: Option<u32>,
}

fn parse_autorestart(raw: &str) -> Result<AutoRestart, String> {
    match raw {
        "always" => Ok(AutoRestart::Always),
        "on-failure" => Ok(AutoRestart::OnFailure),
        "never" => Ok(AutoRestart::Never),
        other => Err(format!("invalid autorestart value '{other}'")),
    }
}

/// Build a fresh [`ManagedProcess`] from `StartParams`, filling in the
/// SPEC_FULL §6/§7 defaults for every field the caller omitted.
fn build_record(id: u32, params: StartParams, ctx: &Arc<DaemonContext>) -> Result<ManagedProcess, String> {
    let default_policy = RestartPolicy::default();
    let name = params
        .name
        .unwrap_or_else(|| Path::new(&params.command).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| params.command.clone()));

    let cwd = params.cwd.unwrap_or_else(|| {
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "/".to_string())
    });

    let auto_restart = match params.autorestart {
        Some(raw) => parse_autorestart(&raw)?,
        None => default_policy.auto_restart,
    };
    let min_uptime_ms = match params.min_uptime {
        Some(raw) => helpers::parse_duration(&raw)?,
        None => default_policy.min_uptime_ms,
    };
    let restart_delay_ms = match params.restart_delay {
        Some(raw) => helpers::parse_duration(&raw)?,
        None => default_policy.restart_delay_ms,
    };
    let max_delay_ms = match params.max_delay {
        Some(raw) => helpers::parse_duration(&raw)?,
        None => default_policy.max_delay_ms,
    };
    let kill_timeout_ms = match params.kill_timeout {
        Some(raw) => helpers::parse_duration(&raw)?,
        None => default_policy.kill_timeout_ms,
    };
    let log_max_size_bytes = match params.max_log_size {
        Some(raw) => helpers::parse_memory(&raw)?,
        None => ctx.config.max_log_size_bytes(),
    };
    let log_max_files = params.max_log_files.unwrap_or_else(|| ctx.config.max_log_files());

    let logs_dir = ctx.config.log_dir();
    let log_out_path = params.log_out.unwrap_or_else(|| format!("{logs_dir}/{name}-out.log"));
    let log_err_path = params.log_err.unwrap_or_else(|| format!("{logs_dir}/{name}-err.log"));

    Ok(ManagedProcess {
        id,
        name,
        command: params.command,
        args: params.args,
        interpreter: params.interpreter,
        cwd,
        env: params.env,
        restart_policy: RestartPolicy {
            auto_restart,
            max_restarts: params.max_restarts.unwrap_or(default_policy.max_restarts),
            min_uptime_ms,
            restart_delay_ms,
            exp_backoff: params.exp_backoff,
            max_delay_ms,
            kill_signal: default_policy.kill_signal,
            kill_timeout_ms,
        },
        status: Status::Stopped,
        status_reason: None,
        pid: 0,
        restart_count: 0,
        last_start: None,
        created_at: Utc::now(),
        last_exit_code: None,
        cpu_percent: 0.0,
        memory_rss_bytes: 0,
        log_out_path,
        log_err_path,
        log_max_size_bytes,
        log_max_files,
    })
}

async fn start(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let params: StartParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(err) => return Response::err(format!("invalid start params: {err}")),
    };

    let name = params.name.clone().unwrap_or_else(|| {
        Path::new(&params.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| params.command.clone())
    });

    if let Some(existing) = ctx.table.by_name(&name).await {
        let snapshot = existing.snapshot().await;
        if snapshot.command != params.command {
            return Response::err(format!(
                "process '{}' already exists with a different command",
                snapshot.name
            ));
        }
        let _ = existing.events.send(crate::supervisor::SupervisorEvent::Start);
        return Response::ok(record_json(&snapshot));
    }

    let id = ctx.table.allocate_id().await;
    let record = match build_record(id, params, ctx) {
        Ok(record) => record,
        Err(err) => return Response::err(err),
    };
    let record_copy = record.clone();
    daemon::spawn_new(ctx, record).await;
    Response::ok(record_json(&record_copy))
}

async fn resolve_or_err(ctx: &Arc<DaemonContext>, params: Value) -> Result<Vec<Arc<RecordHandle>>, Response> {
    let target = parse_target(params)?;
    let handles = ctx.table.resolve(&target).await;
    if handles.is_empty() {
        return Err(Response::err("target not found"));
    }
    Ok(handles)
}

async fn stop(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let handles = match resolve_or_err(ctx, params).await {
        Ok(handles) => handles,
        Err(response) => return response,
    };

    let mut names = Vec::with_capacity(handles.len());
    let mut tasks = Vec::with_capacity(handles.len());
    for handle in &handles {
        names.push(handle.snapshot().await.name);
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move { daemon::stop_and_wait(&handle).await }));
    }
    for task in tasks {
        let _ = task.await;
    }

    Response::ok(json!({ "stopped": names }))
}

async fn restart(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let target = match parse_target(params) {
        Ok(target) => target,
        Err(response) => return response,
    };
    let handles = ctx.table.resolve(&target).await;
    if handles.is_empty() {
        return Response::err("target not found");
    }

    let mut tasks = Vec::with_capacity(handles.len());
    for handle in &handles {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            daemon::restart_and_wait(&handle).await;
            handle.snapshot().await
        }));
    }
    let mut records = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(record) = task.await {
            records.push(record);
        }
    }

    match target {
        Target::All => Response::ok(json!(records)),
        _ => records
            .into_iter()
            .next()
            .map(|record| Response::ok(record_json(&record)))
            .unwrap_or_else(|| Response::err("target not found")),
    }
}

async fn delete(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let handles = match resolve_or_err(ctx, params).await {
        Ok(handles) => handles,
        Err(response) => return response,
    };

    let mut names = Vec::with_capacity(handles.len());
    for handle in &handles {
        names.push(handle.snapshot().await.name);
    }

    let mut tasks = Vec::with_capacity(handles.len());
    for handle in handles {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move { daemon::delete(&ctx, handle).await }));
    }
    for task in tasks {
        let _ = task.await;
    }

    Response::ok(json!({ "deleted": names }))
}

async fn list(ctx: &Arc<DaemonContext>) -> Response {
    Response::ok(json!(ctx.table.list().await))
}

async fn describe(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let target = match parse_target(params) {
        Ok(target) => target,
        Err(response) => return response,
    };
    if target == Target::All {
        return Response::err("describe does not accept target 'all'");
    }
    match ctx.table.resolve(&target).await.into_iter().next() {
        Some(handle) => Response::ok(record_json(&handle.snapshot().await)),
        None => Response::err("target not found"),
    }
}

async fn isrunning(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let target = match parse_target(params) {
        Ok(target) => target,
        Err(response) => return response,
    };
    match ctx.table.resolve(&target).await.into_iter().next() {
        Some(handle) => {
            let record = handle.snapshot().await;
            Response::ok(json!({
                "name": record.name,
                "running": record.status == Status::Online,
                "status": record.status,
                "pid": record.pid,
                "exit_code": record.last_exit_code,
                "restarts": record.restart_count,
            }))
        }
        None => Response::err("target not found"),
    }
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    target: String,
    #[serde(default = "default_lines")]
    lines: usize,
    #[serde(default)]
    err_only: bool,
}

fn default_lines() -> usize {
    15
}

fn tail_lines(path: &str, n: usize) -> String {
    let contents = std::fs::read_to_string(path).unwrap_or_default();
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(n);
    all[start..].join("\n")
}

async fn logs(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let params: LogsParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(err) => return Response::err(format!("invalid logs params: {err}")),
    };
    let target = Target::parse(&params.target);

    if target == Target::All {
        let mut content = String::new();
        for record in ctx.table.list().await {
            let path = if params.err_only { &record.log_err_path } else { &record.log_out_path };
            content.push_str(&format!("==> {} <==\n", record.name));
            content.push_str(&tail_lines(path, params.lines));
            content.push('\n');
        }
        return Response::ok(json!({ "content": content, "log_path": "" }));
    }

    match ctx.table.resolve(&target).await.into_iter().next() {
        Some(handle) => {
            let record = handle.snapshot().await;
            let path = if params.err_only { record.log_err_path.clone() } else { record.log_out_path.clone() };
            Response::ok(json!({ "content": tail_lines(&path, params.lines), "log_path": path }))
        }
        None => Response::err("target not found"),
    }
}

fn truncate_file(path: &str) -> std::io::Result<()> {
    std::fs::OpenOptions::new().write(true).truncate(true).create(true).open(path)?;
    Ok(())
}

/// Truncate the current log file(s), per SPEC_FULL §4.6 `flush`. When the
/// record is online, truncation goes through the supervisor's own live
/// [`crate::log_writer::RotatingWriter`] so its byte counter stays in sync
/// with the on-disk size instead of racing a bare filesystem truncate against
/// an open append-mode writer (SPEC_FULL §4.1).
async fn flush(ctx: &Arc<DaemonContext>, params: Value) -> Response {
    let handles = match resolve_or_err(ctx, params).await {
        Ok(handles) => handles,
        Err(response) => return response,
    };

    let mut flushed = Vec::with_capacity(handles.len());
    for handle in handles {
        let record = handle.snapshot().await;
        let writers = handle.current_writers.lock().await.clone();
        match writers {
            Some((out_writer, err_writer)) => {
                if let Err(err) = out_writer.truncate() {
                    log::warn!("{}: failed to flush stdout log: {err}", record.name);
                }
                if let Err(err) = err_writer.truncate() {
                    log::warn!("{}: failed to flush stderr log: {err}", record.name);
                }
            }
            None => {
                if let Err(err) = truncate_file(&record.log_out_path) {
                    log::warn!("{}: failed to flush stdout log: {err}", record.name);
                }
                if let Err(err) = truncate_file(&record.log_err_path) {
                    log::warn!("{}: failed to flush stderr log: {err}", record.name);
                }
            }
        }
        flushed.push(record.name);
    }

    Response::ok(json!({ "flushed": flushed }))
}

async fn resurrect(ctx: &Arc<DaemonContext>) -> Response {
    let records = daemon::resurrect(ctx).await;
    Response::ok(json!(records))
}

async fn save(ctx: &Arc<DaemonContext>) -> Response {
    let records = ctx.table.list().await;
    let count = records.len();
    persist::write(&records);
    Response::ok(json!({ "count": count }))
}

fn kill(ctx: &Arc<DaemonContext>) -> Response {
    ctx.request_shutdown(false);
    Response::ok(json!({}))
}

fn reboot(ctx: &Arc<DaemonContext>) -> Response {
    ctx.request_shutdown(true);
    Response::ok(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_rejects_missing_field() {
        let result = parse_target(json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn parse_target_accepts_all() {
        let target = parse_target(json!({"target": "all"})).unwrap();
        assert_eq!(target, Target::All);
    }

    #[test]
    fn autorestart_rejects_unknown_value() {
        assert!(parse_autorestart("sometimes").is_err());
        assert_eq!(parse_autorestart("never").unwrap(), AutoRestart::Never);
    }
}
