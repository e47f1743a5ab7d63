//! Host identity and process liveness queries used by stale-lock detection.
use std::sync::OnceLock;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

const UNKNOWN_HOST: &str = "localhost";
/// Process start times are second-granular and may lag the wall clock slightly.
const START_TIME_SLACK_SECS: f64 = 2.0;

static HOST_IDENTIFIER: OnceLock<String> = OnceLock::new();

/// Returns a stable identifier for the current host, resolved once per process.
pub fn host_identifier() -> &'static str {
    HOST_IDENTIFIER.get_or_init(|| {
        System::host_name()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_HOST.to_string())
    })
}

/// Reports whether `pid` names a live process on this host.
///
/// Inspects the process table only; nothing is signalled. On platforms
/// `sysinfo` cannot inspect the process is assumed alive.
pub fn process_is_alive(pid: u32) -> bool {
    owner_is_running(pid, 0.0)
}

/// Reports whether `pid` is still the process that wrote a lock at `lock_created_at`.
///
/// A live process that started after the lock was written is a reused pid and
/// counts as gone. A `lock_created_at` of zero or less skips that check.
pub fn owner_is_running(pid: u32, lock_created_at: f64) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return true;
    }

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let Some(process) = system.process(pid) else {
        return false;
    };
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return false;
    }
    !started_after(process.start_time(), lock_created_at)
}

fn started_after(process_start_secs: u64, lock_created_at: f64) -> bool {
    lock_created_at > 0.0 && process_start_secs as f64 > lock_created_at + START_TIME_SLACK_SECS
}

#[cfg(test)]
mod tests {
    use ward_core::current_unix_seconds;

    use super::{host_identifier, owner_is_running, process_is_alive, started_after};
    use crate::tests::reaped_child_pid;

    #[test]
    fn unit_current_process_is_alive() {
        assert!(process_is_alive(std::process::id()));
    }

    #[test]
    fn unit_pid_zero_is_never_alive() {
        assert!(!process_is_alive(0));
    }

    #[test]
    fn functional_reaped_child_is_reported_dead() {
        let pid = reaped_child_pid();
        assert!(!process_is_alive(pid));
    }

    #[test]
    fn unit_host_identifier_is_stable_and_non_empty() {
        let first = host_identifier();
        assert!(!first.trim().is_empty());
        assert_eq!(first, host_identifier());
    }

    #[test]
    fn unit_started_after_allows_clock_slack() {
        assert!(!started_after(1_000, 999.5));
        assert!(!started_after(1_002, 1_000.0));
        assert!(started_after(1_003, 1_000.0));
        assert!(!started_after(5_000, 0.0));
    }

    #[cfg(unix)]
    #[test]
    fn regression_reused_pid_does_not_keep_an_old_lock_alive() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleeper");
        let pid = child.id();

        let now = current_unix_seconds();
        assert!(owner_is_running(pid, now));
        assert!(process_is_alive(pid));
        assert!(!owner_is_running(pid, now - 3_600.0));

        child.kill().expect("kill sleeper");
        child.wait().expect("reap sleeper");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn regression_unreaped_zombie_is_reported_dead() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn child");
        let pid = child.id();
        std::thread::sleep(std::time::Duration::from_millis(300));

        assert!(!process_is_alive(pid), "exited child awaiting reap is a zombie");
        child.wait().expect("reap child");
    }
}
