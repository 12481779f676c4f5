//! Change log codec
//!
//! Every closed part stores its [`ChangeLog`] next to its archive as a small
//! text file:
//!
//! ```text
//! +dir1/
//! +dir1/file.txt
//! \t<base64 sha-256>
//! -old.txt
//! #2024-05-01 12-00-00
//! ```
//!
//! Lines starting with `+` are additions; file additions (no trailing `/`) are
//! followed by a tab-indented digest line. Lines starting with `-` are
//! removals. The final line repeats the part's own name after `#` and marks
//! the log as complete. Parsing is strict: any deviation is reported as a
//! corrupted part.

use crate::digest::ContentDigest;
use crate::error::{BackupError, Result};
use crate::types::{Change, ChangeLog, PartId, RelPath};

/// Render a change log, terminated by the `#name` marker
///
/// Additions come first, then removals, each in path order.
pub fn render(changes: &ChangeLog, part_name: &str) -> String {
    let mut out = String::new();

    for (path, change) in changes {
        if let Change::Addition(digest) = change {
            out.push('+');
            out.push_str(path.as_str());
            out.push('\n');
            if let Some(digest) = digest {
                out.push('\t');
                out.push_str(&digest.to_base64());
                out.push('\n');
            }
        }
    }
    for (path, change) in changes {
        if let Change::Removal = change {
            out.push('-');
            out.push_str(path.as_str());
            out.push('\n');
        }
    }

    out.push('#');
    out.push_str(part_name);
    out.push('\n');
    out
}

/// Parse a change log written for `part`
///
/// # Errors
///
/// - [`BackupError::CorruptedPart`] for a missing or mismatched end marker,
///   empty lines, unknown line prefixes, missing or malformed digest lines,
///   paths escaping the root, and duplicate paths
pub fn parse(text: &str, part: &PartId) -> Result<ChangeLog> {
    let corrupt = |reason: String| BackupError::corrupted(part.clone(), reason);

    let normalized;
    let text = if text.contains('\r') {
        normalized = text.replace("\r\n", "\n");
        normalized.as_str()
    } else {
        text
    };
    let text = text.strip_suffix('\n').unwrap_or(text);
    if text.is_empty() {
        return Err(corrupt("change log is empty".to_string()));
    }

    let mut lines: Vec<&str> = text.split('\n').collect();
    let marker = lines.pop().unwrap_or_default();
    match marker.strip_prefix('#') {
        Some(name) if name == part.name => {}
        Some(name) => {
            return Err(corrupt(format!(
                "end marker names part '{}' instead of '{}'",
                name, part.name
            )))
        }
        None => return Err(corrupt("change log has no end marker".to_string())),
    }

    let mut changes = ChangeLog::new();
    let mut iter = lines.into_iter().enumerate();
    while let Some((idx, line)) = iter.next() {
        let line_no = idx + 1;
        let mut chars = line.chars();
        let (path, change) = match chars.next() {
            None => return Err(corrupt(format!("empty line {}", line_no))),
            Some('+') => {
                let path = checked_path(chars.as_str(), line_no).map_err(corrupt)?;
                let digest = if path.is_dir() {
                    None
                } else {
                    let digest_line = match iter.next() {
                        Some((_, l)) => l,
                        None => {
                            return Err(corrupt(format!(
                                "addition of {} on line {} has no digest",
                                path, line_no
                            )))
                        }
                    };
                    let digest = digest_line
                        .strip_prefix('\t')
                        .and_then(ContentDigest::from_base64)
                        .ok_or_else(|| {
                            corrupt(format!("invalid digest for {} after line {}", path, line_no))
                        })?;
                    Some(digest)
                };
                (path, Change::Addition(digest))
            }
            Some('-') => {
                let path = checked_path(chars.as_str(), line_no).map_err(corrupt)?;
                (path, Change::Removal)
            }
            Some(c) => {
                return Err(corrupt(format!(
                    "unexpected character '{}' at start of line {}",
                    c.escape_debug(),
                    line_no
                )))
            }
        };

        if changes.contains_key(&path) {
            return Err(corrupt(format!("path {} recorded twice", path)));
        }
        changes.insert(path, change);
    }

    Ok(changes)
}

fn checked_path(raw: &str, line_no: usize) -> std::result::Result<RelPath, String> {
    let path = RelPath::new(raw);
    if !path.is_contained() {
        return Err(format!("invalid path '{}' on line {}", raw, line_no));
    }
    Ok(path)
}
