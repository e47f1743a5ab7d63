use std::path::PathBuf;
use std::time::Duration;

use ward_core::LogRotationPolicy;
use ward_lock::LockOptions;

const DEFAULT_REGISTRY_PATH: &str = ".ward/runs.json";
const DEFAULT_RUN_RETENTION_SECS: u64 = 24 * 60 * 60;
const RUN_RETENTION_ENV: &str = "WARD_RUN_RETENTION_SECS";
const RUN_EVENTS_ENV: &str = "WARD_RUN_EVENTS";

/// Runtime configuration for a persisted run registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRegistryConfig {
    pub registry_path: PathBuf,
    pub lock: LockOptions,
    /// Age after which terminal runs are dropped by [`crate::RunRegistry::run_retention_sweep`].
    pub retention: Duration,
    pub event_log_enabled: bool,
    pub event_log_rotation: LogRotationPolicy,
}

impl Default for RunRegistryConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            lock: LockOptions::default(),
            retention: Duration::from_secs(DEFAULT_RUN_RETENTION_SECS),
            event_log_enabled: true,
            event_log_rotation: LogRotationPolicy::default(),
        }
    }
}

impl RunRegistryConfig {
    /// Defaults for a registry stored at `registry_path`.
    pub fn at(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            ..Self::default()
        }
    }

    /// Builds config for `registry_path` with `WARD_*` environment overrides applied.
    pub fn from_env(registry_path: impl Into<PathBuf>) -> Self {
        let defaults = Self::default();
        let retention = std::env::var(RUN_RETENTION_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.retention);
        let event_log_enabled = std::env::var(RUN_EVENTS_ENV)
            .ok()
            .map(|raw| parse_switch(&raw).unwrap_or(defaults.event_log_enabled))
            .unwrap_or(defaults.event_log_enabled);
        Self {
            registry_path: registry_path.into(),
            lock: LockOptions::from_env(),
            retention,
            event_log_enabled,
            event_log_rotation: LogRotationPolicy::from_env(),
        }
    }

    /// Path of the JSONL transition log kept next to the registry file.
    pub fn event_log_path(&self) -> PathBuf {
        let mut raw = self.registry_path.as_os_str().to_os_string();
        raw.push(".events.jsonl");
        PathBuf::from(raw)
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
