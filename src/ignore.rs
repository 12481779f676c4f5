//! Ignore matcher
//!
//! An [`IgnoreSet`] is a trie keyed by path segment. Directory segments keep
//! their trailing `/`, so `a/b/` is stored as the keys `a/` and `b/` while the
//! file `a/b` ends in the key `b`. A node flagged as ignored excludes itself
//! and, for directories, everything below it.
//!
//! ## Conflicting entries
//!
//! An ignored directory absorbs its descendants: adding `a/b/c` after `a/b/`
//! is a no-op, and adding `a/b/` after `a/b/c` drops the more specific entry.
//!
//! ## Ignore files
//!
//! [`parse_ignore_file`] reads one path per line. `//` starts a comment,
//! surrounding whitespace is trimmed and blank lines are skipped.
//!
//! ```rust
//! use backline::ignore::IgnoreSet;
//! use backline::types::RelPath;
//!
//! let ignore = IgnoreSet::from_paths(["a/b/"]);
//! assert!(ignore.is_ignored(&RelPath::new("a/b/c")));
//! assert!(!ignore.is_ignored(&RelPath::new("a/b")));
//! ```

use crate::error::{BackupError, Result};
use crate::types::RelPath;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use tracing::trace;

#[derive(Debug, Clone, Default)]
struct Node {
    children: HashMap<String, Node>,
    ignored: bool,
}

/// Set of ignored relative paths
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    root: Node,
    entries: BTreeSet<String>,
}

/// Split a normalized path into trie keys, keeping each `/`
fn keys(path: &str) -> impl Iterator<Item = &str> {
    path.split_inclusive('/').filter(|s| *s != "/")
}

impl IgnoreSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from path strings
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for path in paths {
            set.insert(path.as_ref());
        }
        set
    }

    /// Add a path to the set
    ///
    /// Returns `false` if the path is empty or already covered by an
    /// ignored ancestor.
    pub fn insert(&mut self, path: &str) -> bool {
        let path = RelPath::from_input(path);
        let mut segments = keys(path.as_str()).peekable();
        let mut node = &mut self.root;

        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                node.children.insert(
                    segment.to_string(),
                    Node {
                        children: HashMap::new(),
                        ignored: true,
                    },
                );
                self.entries.insert(path.as_str().to_string());
                trace!("Ignoring {}", path);
                return true;
            }
            node = node.children.entry(segment.to_string()).or_default();
            if node.ignored {
                trace!("Ignore entry {} already covered by a parent", path);
                return false;
            }
        }
        false
    }

    /// Whether `path` is excluded
    pub fn is_ignored(&self, path: &RelPath) -> bool {
        self.is_ignored_str(path.as_str())
    }

    /// Like [`IgnoreSet::is_ignored`] for an already-normalized string
    pub fn is_ignored_str(&self, path: &str) -> bool {
        let mut node = &self.root;
        for segment in keys(path) {
            match node.children.get(segment) {
                None => return false,
                Some(child) if child.ignored => return true,
                Some(child) => node = child,
            }
        }
        false
    }

    /// Whether nothing is ignored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The paths this set was built from, normalized
    ///
    /// Includes entries later absorbed by a parent.
    pub fn entries(&self) -> &BTreeSet<String> {
        &self.entries
    }
}

/// Parse ignore file contents into path entries
pub fn parse_ignore_file(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| match line.find("//") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.replace('\\', "/"))
        .collect()
}

/// Read and parse an ignore file
///
/// # Errors
///
/// - [`BackupError::IoAt`] if the file cannot be read
pub fn load_ignore_file(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| BackupError::io_at(path, e))?;
    Ok(parse_ignore_file(&text))
}
