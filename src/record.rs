use chrono::serde::ts_milliseconds_option;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `auto_restart` discriminant, per SPEC_FULL §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoRestart {
    Always,
    OnFailure,
    Never,
}

impl Default for AutoRestart {
    fn default() -> Self {
        AutoRestart::Always
    }
}

/// The declarative restart rules attached to a managed process, per SPEC_FULL §3.
///
/// Grounded on the teacher's single global `Daemon { restarts, interval }` +
/// per-process `Crash { crashed, value }`, generalized into a per-record policy
/// carrying the full rule set the spec requires (`min_uptime`, `exp_backoff`,
/// `max_delay`, `kill_signal`, `kill_timeout`) instead of one daemon-wide cap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub auto_restart: AutoRestart,
    /// 0 = unlimited.
    pub max_restarts: u32,
    pub min_uptime_ms: u64,
    pub restart_delay_ms: u64,
    pub exp_backoff: bool,
    pub max_delay_ms: u64,
    pub kill_signal: i32,
    pub kill_timeout_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            auto_restart: AutoRestart::Always,
            max_restarts: 0,
            min_uptime_ms: 1_000,
            restart_delay_ms: 100,
            exp_backoff: false,
            max_delay_ms: 30_000,
            kill_signal: libc::SIGTERM,
            kill_timeout_ms: 5_000,
        }
    }
}

/// Current lifecycle status of a managed process, per SPEC_FULL §3/§4.3.
///
/// `Starting`/`Stopping`/`Exited` are transient supervisor states (§4.3's table)
/// that are never the value persisted on a [`ManagedProcess`] at rest; only the
/// three terminal-or-running states are ever observed on a table snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Stopped,
    Errored,
}

/// Stable, persisted description of one supervised child. Owned exclusively by
/// the process table; mutated only by its owning supervisor or by a table-wide
/// structural lock (see SPEC_FULL §3 "Ownership").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub id: u32,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub interpreter: Option<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,

    pub status: Status,
    pub status_reason: Option<String>,
    /// OS pid of the current child; 0 when not running.
    pub pid: u32,
    pub restart_count: u32,
    #[serde(with = "ts_milliseconds_option")]
    pub last_start: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub last_exit_code: Option<i32>,

    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_rss_bytes: u64,

    pub log_out_path: String,
    pub log_err_path: String,
    pub log_max_size_bytes: u64,
    pub log_max_files: u32,
}

impl ManagedProcess {
    /// Effective argv: `[interpreter, command, args...]` if an interpreter is
    /// set, else `[command, args...]`, per SPEC_FULL §4.3 "Spawn".
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if let Some(interpreter) = &self.interpreter {
            if !interpreter.is_empty() {
                argv.push(interpreter.clone());
            }
        }
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// A sum type over `{id, name, all}`, per SPEC_FULL §4.4/§9 "Polymorphism".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Id(u32),
    Name(String),
    All,
}

impl Target {
    pub fn parse(raw: &str) -> Target {
        if raw == "all" {
            return Target::All;
        }
        match raw.parse::<u32>() {
            Ok(id) => Target::Id(id),
            Err(_) => Target::Name(raw.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parses_decimal_id() {
        assert_eq!(Target::parse("42"), Target::Id(42));
    }

    #[test]
    fn target_parses_all_literal() {
        assert_eq!(Target::parse("all"), Target::All);
    }

    #[test]
    fn target_parses_name_fallback() {
        assert_eq!(Target::parse("api"), Target::Name("api".to_string()));
    }

    #[test]
    fn argv_prepends_interpreter_when_set() {
        let mut process = sample_process();
        process.interpreter = Some("node".to_string());
        process.command = "server.js".to_string();
        assert_eq!(process.argv(), vec!["node", "server.js"]);
    }

    #[test]
    fn argv_omits_interpreter_when_absent() {
        let process = sample_process();
        assert_eq!(process.argv(), vec!["/bin/true"]);
    }

    fn sample_process() -> ManagedProcess {
        ManagedProcess {
            id: 0,
            name: "api".to_string(),
            command: "/bin/true".to_string(),
            args: vec![],
            interpreter: None,
            cwd: "/".to_string(),
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            status: Status::Stopped,
            status_reason: None,
            pid: 0,
            restart_count: 0,
            last_start: None,
            created_at: Utc::now(),
            last_exit_code: None,
            cpu_percent: 0.0,
            memory_rss_bytes: 0,
            log_out_path: "/tmp/api-out.log".to_string(),
            log_err_path: "/tmp/api-err.log".to_string(),
            log_max_size_bytes: 10 * 1024 * 1024,
            log_max_files: 5,
        }
    }
}
