use chrono::Utc;
use macros_rs::{crashln, string};
use std::fs::{self, File};
use std::io;
use std::path::Path;

use crate::helpers;
use crate::record::ManagedProcess;

fn dump_path() -> String {
    global_placeholders::global!("gopm.dump")
}

/// Read the dump file, creating an empty one on first run and quarantining it
/// if it's corrupt, per SPEC_FULL §4.5.
///
/// Grounded on the teacher's `process::dump::read` (create-on-first-run,
/// rename-to-`.corrupted.<timestamp>` recovery on parse failure), switched
/// from `ron` to `serde_json` per SPEC_FULL §1A/§4.5 deviation note.
pub fn read() -> Vec<ManagedProcess> {
    let path = dump_path();

    if !Path::new(&path).is_file() {
        write(&[]);
        log::info!("created gopm dump file");
        return Vec::new();
    }

    match fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(records) => records,
            Err(err) => {
                log::warn!("dump file is corrupt ({err}); quarantining it");
                quarantine(&path);
                write(&[]);
                Vec::new()
            }
        },
        Err(err) => {
            log::warn!("cannot read dump file ({err}); starting empty");
            Vec::new()
        }
    }
}

fn quarantine(path: &str) {
    let backup = format!("{path}.corrupted.{}", Utc::now().format("%Y%m%d_%H%M%S"));
    if let Err(err) = fs::rename(path, &backup) {
        log::warn!("failed to quarantine corrupted dump file: {err}");
    } else {
        log::warn!("corrupted dump file backed up to {backup}");
    }
}

/// Serialize `records` to the dump file via temp-file + fsync + rename, so a
/// reader never observes a partially-written file (SPEC_FULL §4.5 "atomic
/// replace" invariant; the teacher's own `fs::write` is not atomic, which is
/// why this path departs from it).
///
/// A write failure is retried once and otherwise only logged: the dump file
/// is a persistence aid, not load-bearing for serving requests, so it must
/// not take the daemon down (SPEC_FULL §7 "Persistence failure").
pub fn write(records: &[ManagedProcess]) {
    let path = dump_path();
    let contents = match serde_json::to_string_pretty(records) {
        Ok(contents) => contents,
        Err(err) => crashln!("{} Cannot encode dump.\n{}", *helpers::FAIL, string!(err)),
    };

    if atomic_write(&path, contents.as_bytes()).is_err() {
        if let Err(err) = atomic_write(&path, contents.as_bytes()) {
            log::error!("{} failed to write dump file after retry: {}", *helpers::FAIL, err);
        }
    }
}

fn atomic_write(path: &str, contents: &[u8]) -> io::Result<()> {
    let tmp_path = format!("{path}.tmp.{}", std::process::id());

    {
        let mut file = File::create(&tmp_path)?;
        io::Write::write_all(&mut file, contents)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // The `gopm.dump` placeholder is process-global, so these tests must not
    // run concurrently with each other.
    static LOCK: Mutex<()> = Mutex::new(());

    fn init_dump_path(dir: &std::path::Path) {
        global_placeholders::init!("gopm.dump", dir.join("dump.json").display().to_string());
    }

    fn sample() -> ManagedProcess {
        use crate::record::{RestartPolicy, Status};
        ManagedProcess {
            id: 1,
            name: "api".to_string(),
            command: "/bin/true".to_string(),
            args: vec![],
            interpreter: None,
            cwd: "/".to_string(),
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            status: Status::Online,
            status_reason: None,
            pid: 1234,
            restart_count: 0,
            last_start: Some(Utc::now()),
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

    #[test]
    fn round_trips_records() {
        let _guard = LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        init_dump_path(dir.path());

        write(&[sample()]);
        let read_back = read();

        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].name, "api");
    }

    #[test]
    fn missing_file_yields_empty_and_creates_it() {
        let _guard = LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        init_dump_path(dir.path());

        let records = read();
        assert!(records.is_empty());
        assert!(Path::new(&dump_path()).is_file());
    }

    #[test]
    fn corrupted_file_is_quarantined_and_replaced() {
        let _guard = LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        init_dump_path(dir.path());

        fs::write(dump_path(), b"not json").unwrap();
        let records = read();

        assert!(records.is_empty());
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.iter().any(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(".corrupted.")
        }));
    }
}
