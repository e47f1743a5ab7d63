use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Returns the sibling temp path (`<target>.tmp`) used while committing `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(TEMP_FILE_SUFFIX);
    PathBuf::from(raw)
}

/// Writes text using a temp file + rename so readers never observe partial data.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    commit_file_atomic(path, content.as_bytes())
}

/// Replaces `path` with `content` so it is observed either whole-old or whole-new.
///
/// The temp file name is fixed, so concurrent committers of the same target
/// must be serialized by the caller (the record store holds the process lock).
/// A crash mid-commit can leave `<target>.tmp` behind; the target itself is
/// never partially written.
pub fn commit_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_path = temp_path_for(path);
    write_synced_temp_file(&temp_path, content)?;
    if let Err(error) = replace_file(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(error).with_context(|| {
            format!(
                "failed to replace {} with {}",
                path.display(),
                temp_path.display()
            )
        });
    }
    sync_directory(parent_dir);
    Ok(())
}

fn write_synced_temp_file(temp_path: &Path, content: &[u8]) -> Result<()> {
    // Permissions only apply on creation, so drop any leftover from a crashed commit.
    match fs::remove_file(temp_path) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to clear stale {}", temp_path.display()));
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(temp_path)
        .with_context(|| format!("failed to create temporary file {}", temp_path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush temporary file {}", temp_path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    // rename(2) swaps the directory entry in one step.
    fs::rename(from, to)
}

#[cfg(windows)]
fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(error)
            if matches!(
                error.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::AlreadyExists
            ) =>
        {
            // Leaves a short window where neither file exists.
            match fs::remove_file(to) {
                Ok(()) => {}
                Err(remove_error) if remove_error.kind() == std::io::ErrorKind::NotFound => {}
                Err(remove_error) => return Err(remove_error),
            }
            fs::rename(from, to)
        }
        Err(error) => Err(error),
    }
}

#[cfg(not(any(unix, windows)))]
fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::rename(from, to)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::{commit_file_atomic, temp_path_for, write_text_atomic};

    #[test]
    fn unit_temp_path_appends_tmp_suffix() {
        let path = std::path::Path::new("/state/runs.json");
        assert_eq!(
            temp_path_for(path),
            std::path::PathBuf::from("/state/runs.json.tmp")
        );
    }

    #[test]
    fn functional_commit_replaces_existing_content_and_removes_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runs.json");
        commit_file_atomic(&path, b"{\"v\":1}").expect("first commit");
        commit_file_atomic(&path, b"{\"v\":2}").expect("second commit");

        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{\"v\":2}");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn functional_commit_overwrites_leftover_temp_file_from_crashed_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runs.json");
        std::fs::write(&path, "old").expect("seed target");
        std::fs::write(temp_path_for(&path), "half-writ").expect("seed leftover temp");

        write_text_atomic(&path, "new").expect("commit");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "new");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn unit_commit_creates_missing_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".ward/state/runs.json");
        write_text_atomic(&path, "{}").expect("commit");
        assert!(path.exists());
    }

    #[test]
    fn regression_commit_rejects_directory_destination() {
        let temp = tempfile::tempdir().expect("tempdir");
        let error = write_text_atomic(temp.path(), "{}").expect_err("directory should fail");
        assert!(error.to_string().contains("is a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn unit_committed_file_is_owner_read_write_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runs.json");
        write_text_atomic(&path, "{}").expect("commit");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
