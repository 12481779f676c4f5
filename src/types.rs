//! Core data types used throughout the backline library
//!
//! This module contains the vocabulary shared by parts, the orchestrator and
//! restore sinks.
//!
//! ## Overview
//!
//! - **Paths**: [`RelPath`], a `/`-separated path relative to the backed-up
//!   root. Directories carry a trailing `/`, files do not.
//! - **Changes**: [`Change`] and [`ChangeKind`], the entries of a part's
//!   [`ChangeLog`].
//! - **Identity**: [`PartId`], an opaque handle naming a part on disk without
//!   holding on to the live part.
//! - **Results**: [`BackupSummary`], [`MergeSummary`], [`RetentionSummary`] and
//!   [`RestoreSummary`] describe what an operation did.
//!
//! ## Examples
//!
//! ```rust
//! use backline::types::RelPath;
//!
//! let dir = RelPath::new("world/region/");
//! assert!(dir.is_dir());
//! assert_eq!(dir.segments().collect::<Vec<_>>(), vec!["world", "region"]);
//!
//! let file = RelPath::from_input("world\\level.dat");
//! assert_eq!(file.as_str(), "world/level.dat");
//! assert!(!file.is_dir());
//! ```

use crate::digest::ContentDigest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A path relative to the backed-up root
///
/// Segments are joined with `/` and leading separators are stripped. A
/// trailing `/` marks a directory. A `\` is an ordinary name character, as
/// it is on unix file systems; only [`RelPath::from_input`] treats it as a
/// separator. Ordering and equality are plain string comparisons.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    /// Wrap a stored `/`-separated path, stripping leading separators
    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        let trimmed = path.trim_start_matches('/');
        if trimmed.len() != path.len() {
            path = trimmed.to_string();
        }
        RelPath(path)
    }

    /// Parse a path typed by a user, accepting `\` as a separator
    pub fn from_input(path: &str) -> Self {
        Self::new(path.replace('\\', "/"))
    }

    /// Build a path from its segments
    pub fn from_segments<I, S>(segments: I, is_dir: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = String::new();
        for segment in segments {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(segment.as_ref());
        }
        if is_dir && !path.is_empty() {
            path.push('/');
        }
        RelPath(path)
    }

    /// The normalized path string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this path names a directory
    pub fn is_dir(&self) -> bool {
        self.0.ends_with('/')
    }

    /// Whether the path is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Path segments without separators
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Whether the path stays below the root it is relative to
    ///
    /// Rejects `.` and `..` segments so the path can be joined onto a
    /// restore directory without escaping it. On Windows a `\` inside a
    /// segment would act as a separator, so such names are rejected there.
    pub fn is_contained(&self) -> bool {
        !self.is_empty()
            && self
                .segments()
                .all(|s| s != "." && s != ".." && !(cfg!(windows) && s.contains('\\')))
    }

    /// Convert into a native path below `root`
    pub fn to_path(&self, root: &std::path::Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.segments() {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelPath {
    fn from(s: &str) -> Self {
        RelPath::new(s)
    }
}

impl From<String> for RelPath {
    fn from(s: String) -> Self {
        RelPath::new(s)
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for RelPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Kind of a change log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The path was added or modified
    Addition,
    /// The path was removed
    Removal,
}

/// A change log entry
///
/// Additions of files carry the digest of the archived content; additions
/// of directories and all removals carry nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Path added or modified, with the content digest for files
    Addition(Option<ContentDigest>),
    /// Path removed
    Removal,
}

impl Change {
    /// The kind of this change
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Addition(_) => ChangeKind::Addition,
            Change::Removal => ChangeKind::Removal,
        }
    }

    /// Whether this change is an addition
    pub fn is_addition(&self) -> bool {
        matches!(self, Change::Addition(_))
    }

    /// Digest of the added content, if any
    pub fn digest(&self) -> Option<&ContentDigest> {
        match self {
            Change::Addition(digest) => digest.as_ref(),
            Change::Removal => None,
        }
    }
}

/// All changes recorded by one part, keyed by path
pub type ChangeLog = BTreeMap<RelPath, Change>;

/// Opaque identity of a backup part
///
/// Errors carry this instead of the part itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartId {
    /// Part name, derived from its creation time
    pub name: String,
    /// Location of the part's archive
    pub location: PathBuf,
}

impl PartId {
    /// Create a part identity
    pub fn new(name: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.name, self.location.display())
    }
}

/// Outcome of a single backup run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSummary {
    /// Name of the part written, `None` when nothing changed
    pub part: Option<String>,
    /// Time the run was stamped with
    pub started_at: Option<DateTime<Utc>>,
    /// Paths that did not exist in the reconstructed state
    pub added: usize,
    /// Files whose content changed
    pub modified: usize,
    /// Paths that disappeared from the source
    pub removed: usize,
    /// Corrupted parts deleted while loading history
    pub corrupted_removed: Vec<String>,
}

impl BackupSummary {
    /// Total number of recorded changes
    pub fn total_changes(&self) -> usize {
        self.added + self.modified + self.removed
    }
}

/// Outcome of merging a run of parts into one
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeSummary {
    /// Name of the merged part, `None` when there was nothing to merge
    pub target: Option<String>,
    /// Names of the source parts folded into the target
    pub merged: Vec<String>,
    /// Source parts whose deletion failed after a successful merge
    pub failed_deletes: Vec<String>,
    /// Corrupted parts deleted while loading history
    pub corrupted_removed: Vec<String>,
}

/// Outcome of applying a retention policy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionSummary {
    /// Merge of everything older than the policy horizon
    pub horizon_merge: Option<MergeSummary>,
    /// Merges performed inside the policy bands
    pub band_merges: Vec<MergeSummary>,
    /// Parts remaining afterwards
    pub parts_remaining: usize,
}

impl RetentionSummary {
    /// Number of source parts folded away
    pub fn parts_merged(&self) -> usize {
        self.horizon_merge.iter().map(|m| m.merged.len()).sum::<usize>()
            + self.band_merges.iter().map(|m| m.merged.len()).sum::<usize>()
    }
}

/// Outcome of a restore
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Creation time of the newest part included
    pub restore_time: Option<DateTime<Utc>>,
    /// Entries written into the sink
    pub entries_restored: usize,
    /// Parts whose archives were read
    pub parts_read: usize,
    /// Corrupted parts deleted while loading history
    pub corrupted_removed: Vec<String>,
}
