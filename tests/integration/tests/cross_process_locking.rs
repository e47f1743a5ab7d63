use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tempfile::tempdir;
use ward_lock::{host_identifier, LockError, LockOptions, LockRecord, LockState, ProcessLock};
use ward_runs::{
    LoadOutcome, RunCompletion, RunRegistration, RunRegistry, RunRegistryConfig, RunStatus,
};

const PROBE: &str = env!("CARGO_BIN_EXE_ward-probe");

fn spawn_holder(resource: &Path, hold_ms: u64) -> Child {
    let mut child = Command::new(PROBE)
        .args(["hold", "--resource"])
        .arg(resource)
        .args(["--hold-ms", &hold_ms.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn holder");
    let stdout = child.stdout.take().expect("holder stdout");
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("read holder output");
    assert_eq!(line.trim(), "acquired");
    child
}

fn quick_options(timeout_ms: u64) -> LockOptions {
    LockOptions {
        timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(10),
        ..LockOptions::default()
    }
}

#[test]
fn integration_processes_increment_shared_counter_without_lost_updates() {
    let temp = tempdir().expect("tempdir");
    let counter = temp.path().join("counter.json");

    let children = (0..4)
        .map(|index| {
            Command::new(PROBE)
                .args(["increment", "--counter"])
                .arg(&counter)
                .args(["--times", "10", "--writer", &format!("proc-{index}")])
                .spawn()
                .expect("spawn incrementer")
        })
        .collect::<Vec<_>>();
    for mut child in children {
        let status = child.wait().expect("wait incrementer");
        assert!(status.success(), "incrementer failed: {status}");
    }

    let raw = std::fs::read_to_string(&counter).expect("counter written");
    let document: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(document["count"], 40);
    assert_eq!(document["writers"].as_array().expect("writers").len(), 40);
    assert!(!ProcessLock::new(&counter).lock_path().exists());
}

#[test]
fn integration_live_holder_in_other_process_forces_timeout() {
    let temp = tempdir().expect("tempdir");
    let resource = temp.path().join("shared.json");
    let mut holder = spawn_holder(&resource, 30_000);

    let lock = ProcessLock::with_options(&resource, quick_options(300));
    let LockState::Held(record) = lock.inspect() else {
        panic!("expected lock to be held by the probe");
    };
    assert_eq!(record.owner_pid, holder.id());

    let started = Instant::now();
    let error = lock.acquire().expect_err("holder is alive");
    assert!(matches!(error, LockError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(300));

    holder.kill().expect("kill holder");
    holder.wait().expect("reap holder");
}

#[test]
fn integration_lock_left_by_killed_process_is_reclaimed() {
    let temp = tempdir().expect("tempdir");
    let resource = temp.path().join("shared.json");
    let mut holder = spawn_holder(&resource, 30_000);
    holder.kill().expect("kill holder");
    holder.wait().expect("reap holder");

    let lock = ProcessLock::with_options(&resource, quick_options(2_000));
    assert!(lock.lock_path().exists(), "killed holder leaves its lock file");
    let guard = lock.acquire().expect("stale lock reclaimed");
    assert_eq!(guard.record().owner_pid, std::process::id());
}

#[test]
fn integration_lock_released_by_exiting_holder_is_free() {
    let temp = tempdir().expect("tempdir");
    let resource = temp.path().join("shared.json");
    let mut holder = spawn_holder(&resource, 50);
    let status = holder.wait().expect("wait holder");
    assert!(status.success());

    let lock = ProcessLock::with_options(&resource, quick_options(200));
    assert_eq!(lock.inspect(), LockState::Free);
    lock.acquire().expect("free lock");
}

#[test]
fn integration_run_abandoned_by_exited_process_is_reported_orphaned() {
    let temp = tempdir().expect("tempdir");
    let registry_path = temp.path().join("runs.json");
    let status = Command::new(PROBE)
        .args(["abandon-run", "--run-id", "r1", "--registry"])
        .arg(&registry_path)
        .status()
        .expect("run probe");
    assert!(status.success());

    let registry = RunRegistry::open(RunRegistryConfig::at(&registry_path));
    assert_eq!(registry.open_report().load_outcome, LoadOutcome::Loaded);
    assert_eq!(registry.open_report().orphaned_runs, vec!["r1".to_string()]);
    assert_eq!(
        registry.get("r1").expect("persisted").status,
        RunStatus::Running
    );

    registry
        .complete("r1", RunCompletion::completed("finished after restart"))
        .expect("complete");
    let reopened = RunRegistry::open(RunRegistryConfig::at(&registry_path));
    assert!(!reopened.open_report().has_orphaned_runs());
}

#[test]
fn integration_second_process_reclaims_dead_lock_and_sees_running_run() {
    let temp = tempdir().expect("tempdir");
    let registry_path = temp.path().join("runs.json");
    let registry = RunRegistry::open(RunRegistryConfig::at(&registry_path));
    registry
        .register(RunRegistration::new("r1", "long task"))
        .expect("register r1");

    let mut finished = Command::new(PROBE)
        .arg("--help")
        .stdout(Stdio::null())
        .spawn()
        .expect("spawn short-lived probe");
    let dead_pid = finished.id();
    finished.wait().expect("reap probe");

    let planted = LockRecord {
        owner_pid: dead_pid,
        created_at: 0.0,
        host_identifier: host_identifier().to_string(),
        owner_token: "planted".to_string(),
    };
    let lock = ProcessLock::new(&registry_path);
    std::fs::write(
        lock.lock_path(),
        planted.to_json_bytes().expect("encode planted record"),
    )
    .expect("plant lock");
    assert!(matches!(lock.inspect(), LockState::Stale(_)));

    let output = Command::new(PROBE)
        .args(["--lock-timeout-ms", "2000", "show-run", "--run-id", "r1", "--registry"])
        .arg(&registry_path)
        .output()
        .expect("run probe");
    assert!(
        output.status.success(),
        "status={} stderr={}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "r1 running");
    assert_eq!(lock.inspect(), LockState::Free);
}
