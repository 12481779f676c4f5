//! Utility functions for backline
//!
//! ## Categories of Utilities
//!
//! ### Part names
//! - Rendering and parsing the `yyyy-MM-dd HH-mm-ss` names parts are stored
//!   under, always in UTC
//! - Truncating timestamps to the whole seconds names can represent
//!
//! ### File Operations
//! - Atomic file writing for change logs
//! - Free space queries for the storage root
//!
//! ### Display
//! - Byte formatting (human-readable sizes)
//!
//! All functions are thread-safe and can be called concurrently.

use crate::error::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use std::fs;
use std::path::Path;

/// `strftime` pattern of part names
pub const PART_TIME_FORMAT: &str = "%Y-%m-%d %H-%M-%S";

/// Render the part name for `time`
///
/// # Example
///
/// ```rust
/// use backline::utils::format_part_time;
/// use chrono::{TimeZone, Utc};
///
/// let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
/// assert_eq!(format_part_time(time), "2024-05-01 12-30-00");
/// ```
pub fn format_part_time(time: DateTime<Utc>) -> String {
    time.format(PART_TIME_FORMAT).to_string()
}

/// Parse a part name back into its creation time
///
/// Returns `None` for names that were not produced by [`format_part_time`].
pub fn parse_part_time(name: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(name, PART_TIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Drop sub-second precision
pub fn truncate_to_secs(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Parse a user-supplied point in time
///
/// Accepts RFC 3339 (`2024-05-01T12:30:00Z`) or the part name format,
/// interpreted as UTC.
///
/// # Errors
///
/// - [`BackupError::InvalidConfiguration`] if neither format matches
pub fn parse_time_arg(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Ok(time.with_timezone(&Utc));
    }
    parse_part_time(text).ok_or_else(|| {
        BackupError::InvalidConfiguration(format!(
            "'{}' is neither RFC 3339 nor '{}'",
            text, PART_TIME_FORMAT
        ))
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write (write to temp file then rename)
///
/// The target is either absent or complete; readers never observe a partial
/// write.
///
/// # Errors
///
/// - [`BackupError::IoAt`] if writing the temporary file or the rename fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    if let Err(e) = fs::write(&temp_path, content) {
        let _ = fs::remove_file(&temp_path);
        return Err(BackupError::io_at(&temp_path, e));
    }
    fs::rename(&temp_path, path).map_err(|e| BackupError::io_at(path, e))?;

    Ok(())
}

/// Bytes available to unprivileged users on the filesystem holding `path`
///
/// Returns `-1` if `path` does not exist or the query fails.
#[cfg(unix)]
pub fn usable_space(path: &Path) -> i64 {
    if !path.exists() {
        return -1;
    }
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let bytes = (stat.blocks_available() as u128) * (stat.fragment_size() as u128);
            i64::try_from(bytes).unwrap_or(i64::MAX)
        }
        Err(_) => -1,
    }
}

/// Bytes available on the filesystem holding `path`
///
/// Not supported on this platform; always `-1`.
#[cfg(not(unix))]
pub fn usable_space(_path: &Path) -> i64 {
    -1
}
