use crate::record::{AutoRestart, RestartPolicy};

/// What the supervisor should do after a child exits, per SPEC_FULL §4.3
/// "Exit handling (reaper)".
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Go to `Stopped`; do not restart.
    Stop,
    /// Go to `Errored`; `reason` is surfaced as `status_reason`.
    GiveUp { reason: String },
    /// Restart after sleeping `delay_ms`; `restart_count` is the value the
    /// record should carry once the new spawn attempt is counted.
    Restart { delay_ms: u64, restart_count: u32 },
}

/// Pure restart decision function.
///
/// Grounded on the decision logic embedded in the teacher's `restart_process`
/// (`crash.value` vs `daemon_config.restarts`), pulled out into a standalone
/// testable function per SPEC_FULL §9 ("Polymorphism": "implement it as a
/// standalone testable function, not a method scattered across states").
///
/// `uptime_ms` is the wall-clock duration of the run that just ended.
/// `restart_count` is the counter *before* this exit is applied.
/// `explicit_stop` is true when the supervisor was already unwinding toward
/// `Stopped` because of an RPC `stop`/`delete` (§4.3 step 1).
pub fn decide(
    policy: &RestartPolicy,
    exit_code: i32,
    uptime_ms: u64,
    restart_count: u32,
    explicit_stop: bool,
) -> Decision {
    if explicit_stop {
        return Decision::Stop;
    }

    match policy.auto_restart {
        AutoRestart::Never => return Decision::Stop,
        AutoRestart::OnFailure if exit_code == 0 => return Decision::Stop,
        _ => {}
    }

    let restart_count = if uptime_ms >= policy.min_uptime_ms {
        0
    } else {
        restart_count
    };

    if policy.max_restarts > 0 && restart_count >= policy.max_restarts {
        return Decision::GiveUp {
            reason: "max restarts reached".to_string(),
        };
    }

    let delay_ms = if policy.exp_backoff {
        let scaled = policy
            .restart_delay_ms
            .saturating_mul(1u64 << restart_count.min(32));
        scaled.min(policy.max_delay_ms)
    } else {
        policy.restart_delay_ms
    };

    Decision::Restart {
        delay_ms,
        restart_count: restart_count + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            auto_restart: AutoRestart::Always,
            max_restarts: 3,
            min_uptime_ms: 1_000,
            restart_delay_ms: 100,
            exp_backoff: false,
            max_delay_ms: 30_000,
            kill_signal: libc::SIGTERM,
            kill_timeout_ms: 5_000,
        }
    }

    #[test]
    fn explicit_stop_always_wins() {
        let decision = decide(&policy(), 1, 5_000, 0, true);
        assert_eq!(decision, Decision::Stop);
    }

    #[test]
    fn never_restart_policy_stops() {
        let mut p = policy();
        p.auto_restart = AutoRestart::Never;
        assert_eq!(decide(&p, 1, 5_000, 0, false), Decision::Stop);
    }

    #[test]
    fn on_failure_stops_on_clean_exit() {
        let mut p = policy();
        p.auto_restart = AutoRestart::OnFailure;
        assert_eq!(decide(&p, 0, 5_000, 0, false), Decision::Stop);
    }

    #[test]
    fn on_failure_restarts_on_nonzero_exit() {
        let mut p = policy();
        p.auto_restart = AutoRestart::OnFailure;
        match decide(&p, 1, 5_000, 0, false) {
            Decision::Restart { restart_count, .. } => assert_eq!(restart_count, 1),
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[test]
    fn short_lived_run_increments_counter_toward_limit() {
        let p = policy();
        let d1 = decide(&p, 1, 200, 0, false);
        assert_eq!(
            d1,
            Decision::Restart {
                delay_ms: 100,
                restart_count: 1
            }
        );
        let d2 = decide(&p, 1, 200, 1, false);
        assert_eq!(
            d2,
            Decision::Restart {
                delay_ms: 100,
                restart_count: 2
            }
        );
        let d3 = decide(&p, 1, 200, 2, false);
        assert_eq!(
            d3,
            Decision::GiveUp {
                reason: "max restarts reached".to_string()
            }
        );
    }

    #[test]
    fn stable_run_resets_counter_before_applying_policy() {
        let p = policy();
        // restart_count is already at the limit, but this run was stable.
        let decision = decide(&p, 1, 50_000, 3, false);
        match decision {
            Decision::Restart { restart_count, .. } => assert_eq!(restart_count, 1),
            other => panic!("expected restart after reset, got {other:?}"),
        }
    }

    #[test]
    fn exp_backoff_doubles_until_capped() {
        let mut p = policy();
        p.exp_backoff = true;
        p.max_restarts = 0;
        p.max_delay_ms = 1_000;

        let d0 = decide(&p, 1, 200, 0, false);
        assert_eq!(
            d0,
            Decision::Restart {
                delay_ms: 100,
                restart_count: 1
            }
        );
        let d1 = decide(&p, 1, 200, 1, false);
        assert_eq!(
            d1,
            Decision::Restart {
                delay_ms: 200,
                restart_count: 2
            }
        );
        let d2 = decide(&p, 1, 200, 2, false);
        assert_eq!(
            d2,
            Decision::Restart {
                delay_ms: 400,
                restart_count: 3
            }
        );
        // 100 * 2^5 = 3200, capped at max_delay_ms=1000
        let d5 = decide(&p, 1, 200, 5, false);
        assert_eq!(
            d5,
            Decision::Restart {
                delay_ms: 1_000,
                restart_count: 6
            }
        );
    }

    #[test]
    fn unlimited_restarts_when_max_is_zero() {
        let mut p = policy();
        p.max_restarts = 0;
        for n in 0..100 {
            match decide(&p, 1, 200, n, false) {
                Decision::Restart { .. } => {}
                other => panic!("expected restart at count {n}, got {other:?}"),
            }
        }
    }
}
