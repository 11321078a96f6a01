use global_placeholders::init;
use macros_rs::crashln;
use std::fs;

use crate::helpers;

/// Initialise the `gopm.*` path placeholders and create `<home>/logs` if missing.
///
/// Grounded on the teacher's `globals::init()` (`opm.base`, `opm.log`, `opm.pid`,
/// `opm.dump`, `opm.logs.out`, `opm.logs.error`), renamed to the `gopm.*` namespace
/// and pointed at `$GOPM_HOME` (falling back to `$HOME/.gopm`) per SPEC_FULL §6.
pub fn init() {
    let home = home_dir();

    if !std::path::Path::new(&home).is_dir() {
        if let Err(err) = fs::create_dir_all(&home) {
            crashln!("{} Cannot create {home}: {err}", *helpers::FAIL);
        }
        log::info!("created gopm base dir");
    }

    let logs_dir = format!("{home}/logs");
    if !std::path::Path::new(&logs_dir).is_dir() {
        if let Err(err) = fs::create_dir_all(&logs_dir) {
            crashln!("{} Cannot create {logs_dir}: {err}", *helpers::FAIL);
        }
        log::info!("created gopm log dir");
    }

    init!("gopm.home", home.clone());
    init!("gopm.sock", format!("{home}/gopm.sock"));
    init!("gopm.pid", format!("{home}/daemon.pid"));
    init!("gopm.dump", format!("{home}/dump.json"));
    init!("gopm.config", format!("{home}/config.json"));
    init!("gopm.logs.dir", logs_dir.clone());
    init!("gopm.logs.out", format!("{logs_dir}/{{}}-out.log"));
    init!("gopm.logs.err", format!("{logs_dir}/{{}}-err.log"));
}

/// Resolve the state home: `$GOPM_HOME`, else `$HOME/.gopm`.
pub fn home_dir() -> String {
    if let Ok(path) = std::env::var("GOPM_HOME") {
        return path.trim_end_matches('/').to_string();
    }

    match home::home_dir() {
        Some(path) => format!("{}/.gopm", path.display()),
        None => crashln!("{} Impossible to get your home directory", *helpers::FAIL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_dir_respects_gopm_home() {
        unsafe {
            std::env::set_var("GOPM_HOME", "/tmp/gopm-test-home");
        }
        assert_eq!(home_dir(), "/tmp/gopm-test-home");
        unsafe {
            std::env::remove_var("GOPM_HOME");
        }
    }
}
