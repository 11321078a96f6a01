use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io;

/// `<home>/daemon.pid` read/write/liveness helpers, shared by the daemon
/// (writes its own pid at startup, removes it at shutdown) and the client's
/// auto-start shim (SPEC_FULL §4.7: "inspects the PID file ... if the PID is
/// missing or the process is not alive, it removes stale socket and PID
/// files").
///
/// Grounded on the teacher's `daemon::pid` module (`pid::exists`,
/// `pid::read`, `pid::running`, `pid::remove`), kept a separate module here
/// since both the daemon and the client side of GoPM need it, whereas the
/// teacher's version lived entirely under `daemon::`.
fn pid_path() -> String {
    global_placeholders::global!("gopm.pid")
}

pub fn write(pid: u32) -> io::Result<()> {
    fs::write(pid_path(), pid.to_string())
}

pub fn read() -> Option<u32> {
    fs::read_to_string(pid_path()).ok()?.trim().parse().ok()
}

pub fn remove() {
    let _ = fs::remove_file(pid_path());
}

/// `kill(pid, 0)`-equivalent liveness probe: sends no signal, just checks
/// that the pid exists and is reachable by us.
pub fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn round_trips_pid() {
        let _guard = LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        global_placeholders::init!("gopm.pid", dir.path().join("daemon.pid").display().to_string());

        write(1234).unwrap();
        assert_eq!(read(), Some(1234));
        remove();
        assert_eq!(read(), None);
    }

    #[test]
    fn current_process_is_running() {
        let _guard = LOCK.lock().unwrap();
        assert!(is_running(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_not_running() {
        let _guard = LOCK.lock().unwrap();
        assert!(!is_running(u32::MAX));
    }
}
