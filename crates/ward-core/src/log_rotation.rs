use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

const DEFAULT_LOG_ROTATION_MAX_BYTES: u64 = 4 * 1024 * 1024;
const DEFAULT_LOG_ROTATION_MAX_FILES: usize = 3;
const LOG_ROTATION_MAX_BYTES_ENV: &str = "WARD_LOG_ROTATION_MAX_BYTES";
const LOG_ROTATION_MAX_FILES_ENV: &str = "WARD_LOG_ROTATION_MAX_FILES";

/// Size-based rotation limits for append-only JSONL files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_ROTATION_MAX_BYTES,
            max_files: DEFAULT_LOG_ROTATION_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Reads `WARD_LOG_ROTATION_*` overrides, keeping defaults for missing or invalid values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_bytes: positive_env_value(LOG_ROTATION_MAX_BYTES_ENV).unwrap_or(defaults.max_bytes),
            max_files: positive_env_value(LOG_ROTATION_MAX_FILES_ENV)
                .unwrap_or(defaults.max_files),
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }

    fn needs_rotation(self, current_size: u64, incoming: usize) -> bool {
        let incoming = u64::try_from(incoming.saturating_add(1)).unwrap_or(u64::MAX);
        self.is_enabled() && current_size > 0 && current_size.saturating_add(incoming) > self.max_bytes
    }
}

fn positive_env_value<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

/// Serializes `value` as one compact JSON line and appends it to `path`, rotating first if needed.
pub fn append_json_line<T>(path: &Path, value: &T, policy: LogRotationPolicy) -> Result<()>
where
    T: Serialize,
{
    let line = serde_json::to_string(value).context("failed to encode JSONL record")?;
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let current_size = match std::fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
        Err(error) => {
            return Err(error).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if policy.needs_rotation(current_size, line.len()) {
        shift_rotated_files(path, policy.max_files)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    Ok(())
}

/// Path of the `index`-th rotated backup (`events.jsonl.1` is the newest).
pub fn rotated_backup_path(path: &Path, index: usize) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(format!(".{index}"));
    PathBuf::from(raw)
}

fn shift_rotated_files(path: &Path, max_files: usize) -> Result<()> {
    let backups = max_files.saturating_sub(1);
    if backups == 0 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()));
    }

    let oldest = rotated_backup_path(path, backups);
    if oldest.exists() {
        std::fs::remove_file(&oldest)
            .with_context(|| format!("failed to prune {}", oldest.display()))?;
    }
    for index in (1..backups).rev() {
        let source = rotated_backup_path(path, index);
        if source.exists() {
            let destination = rotated_backup_path(path, index + 1);
            std::fs::rename(&source, &destination).with_context(|| {
                format!("failed to shift {} to {}", source.display(), destination.display())
            })?;
        }
    }
    let first = rotated_backup_path(path, 1);
    std::fs::rename(path, &first)
        .with_context(|| format!("failed to rotate {} to {}", path.display(), first.display()))
}
