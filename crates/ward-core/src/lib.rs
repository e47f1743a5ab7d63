//! Foundational low-level utilities shared across ward crates.
//!
//! Provides the atomic file commit used by the record store, timestamp helpers
//! for the on-disk formats, and the size-rotated JSONL appender behind the run
//! event log.

pub mod atomic_io;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::{commit_file_atomic, temp_path_for, write_text_atomic};
pub use log_rotation::{append_json_line, rotated_backup_path, LogRotationPolicy};
pub use time_utils::{
    current_unix_seconds, current_unix_timestamp_ms, is_older_than, unix_seconds_to_rfc3339,
};
