use std::collections::HashMap;
use std::fs;
use std::time::Instant;

/// One `{cpu_percent, memory_rss_bytes}` observation, or `None` when the pid
/// has vanished from `/proc` (SPEC_FULL §4.2 "gone" detection).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub cpu_percent: f64,
    pub memory_rss_bytes: u64,
}

#[derive(Clone, Copy)]
struct Prior {
    cpu_ticks: u64,
    at: Instant,
}

/// Delta-based CPU/RSS sampler driven by the daemon's periodic tick, per
/// SPEC_FULL §4.2. Unlike a one-shot "sleep between two reads" sampler, this
/// keeps the previous `(utime+stime, wall-clock instant)` per pid across
/// ticks, so a tick never blocks waiting out a measurement window.
///
/// Grounded on the teacher's `process::unix::cpu::get_cpu_percent_fast` (ticks
/// from `/proc/<pid>/stat` fields 13/14, `libc::sysconf(_SC_CLK_TCK)` for the
/// tick rate) and `process_info::get_process_name`'s `/proc/<pid>/...` access
/// pattern; generalized from "divide by uptime-since-start" to "divide by
/// wall-clock delta since the last tick" since the supervisor already knows
/// when ticks happen and doesn't need `/proc/uptime`.
pub struct Sampler {
    ticks_per_sec: f64,
    prior: HashMap<u32, Prior>,
}

impl Sampler {
    pub fn new() -> Self {
        Sampler {
            ticks_per_sec: clock_ticks_per_sec(),
            prior: HashMap::new(),
        }
    }

    /// Sample one pid. Returns `None` if the process is gone; the caller
    /// should then clear its `cpu_percent`/`memory_rss_bytes` to zero.
    pub fn sample(&mut self, pid: u32) -> Option<Sample> {
        let cpu_ticks = match read_cpu_ticks(pid) {
            Some(ticks) => ticks,
            None => {
                self.prior.remove(&pid);
                return None;
            }
        };
        let memory_rss_bytes = read_rss_bytes(pid).unwrap_or(0);
        let now = Instant::now();

        let cpu_percent = match self.prior.insert(pid, Prior { cpu_ticks, at: now }) {
            Some(prior) if cpu_ticks >= prior.cpu_ticks => {
                let elapsed = now.duration_since(prior.at).as_secs_f64();
                if elapsed > 0.0 {
                    let tick_delta = (cpu_ticks - prior.cpu_ticks) as f64;
                    ((tick_delta / self.ticks_per_sec) / elapsed * 100.0).min(100.0 * num_cpus())
                } else {
                    0.0
                }
            }
            // First sample for this pid, or a counter reset (pid reuse): 0.
            _ => 0.0,
        };

        Some(Sample {
            cpu_percent,
            memory_rss_bytes,
        })
    }

    /// Forget a pid's prior reading, e.g. once its supervisor reaps it.
    pub fn forget(&mut self, pid: u32) {
        self.prior.remove(&pid);
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm can contain spaces/parens; split past its closing paren, same as
    // the teacher's zombie-state parser.
    let after_comm = stat.rfind(')').map(|i| &stat[i + 1..])?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is state (field 3 overall); utime/stime are fields 14/15
    // overall, i.e. indices 11/12 here.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Per SPEC_FULL §4.2: "On non-Linux systems the sampler returns zeroed
/// metrics and never errors" — including never reporting a live pid as
/// "gone", since there is no `/proc` to consult for liveness here.
#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks(_pid: u32) -> Option<u64> {
    Some(0)
}

#[cfg(target_os = "linux")]
fn read_rss_bytes(pid: u32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

fn clock_ticks_per_sec() -> f64 {
    #[cfg(target_os = "linux")]
    {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    100.0
}

fn num_cpus() -> f64 {
    num_cpus::get() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_of_a_pid_is_zero_cpu() {
        let mut sampler = Sampler::new();
        let pid = std::process::id();
        let sample = sampler.sample(pid).expect("current process must exist");
        assert_eq!(sample.cpu_percent, 0.0);
    }

    #[test]
    fn vanished_pid_returns_none() {
        let mut sampler = Sampler::new();
        let sample = sampler.sample(u32::MAX);
        assert!(sample.is_none());
    }

    #[test]
    fn forget_clears_prior_state() {
        let mut sampler = Sampler::new();
        let pid = std::process::id();
        sampler.sample(pid);
        assert!(sampler.prior.contains_key(&pid));
        sampler.forget(pid);
        assert!(!sampler.prior.contains_key(&pid));
    }
}
