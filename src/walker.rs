//! Pre-order directory walker
//!
//! [`DirWalker`] yields every entry below a root as a [`WalkEntry`], each
//! directory before its contents and siblings in file-name order. Ignored
//! entries are pruned before descending, so an ignored directory's subtree
//! is never read.
//!
//! Symbolic links are not followed. A link to a file is treated as the file
//! it points to; links to directories and dangling links are skipped with a
//! warning.

use crate::cancel::CancelFlag;
use crate::error::{BackupError, Result};
use crate::ignore::IgnoreSet;
use crate::types::RelPath;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};
use walkdir::{DirEntry, WalkDir};

/// One entry produced by the walker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walk root, `/`-suffixed for directories
    pub path: RelPath,
    /// Absolute location on disk
    pub full_path: PathBuf,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

type EntryFilter<'a> = Box<dyn FnMut(&DirEntry) -> bool + Send + 'a>;

/// Single-pass walk over a directory tree
///
/// Create a new walker to walk again.
pub struct DirWalker<'a> {
    inner: walkdir::FilterEntry<walkdir::IntoIter, EntryFilter<'a>>,
    root: PathBuf,
    cancel: CancelFlag,
    finished: bool,
}

impl<'a> DirWalker<'a> {
    /// Walk `root`, skipping everything `ignore` excludes
    pub fn new(root: &Path, ignore: &'a IgnoreSet) -> Self {
        Self::with_cancel(root, ignore, CancelFlag::new())
    }

    /// Walk `root`, stopping with [`BackupError::Cancelled`] once `cancel` is raised
    pub fn with_cancel(root: &Path, ignore: &'a IgnoreSet, cancel: CancelFlag) -> Self {
        let filter_root = root.to_path_buf();
        let filter: EntryFilter<'a> = Box::new(move |entry: &DirEntry| {
            if ignore.is_empty() {
                return true;
            }
            match relative_path(&filter_root, entry.path(), entry.file_type().is_dir()) {
                Ok(path) => {
                    let skip = ignore.is_ignored(&path);
                    if skip {
                        trace!("Skipping ignored path {}", path);
                    }
                    !skip
                }
                // surfaced as an error when the entry is yielded
                Err(_) => true,
            }
        });

        let inner = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(filter);

        Self {
            inner,
            root: root.to_path_buf(),
            cancel,
            finished: false,
        }
    }

    fn convert(&self, entry: DirEntry) -> Result<Option<WalkEntry>> {
        let file_type = entry.file_type();
        let mut is_dir = file_type.is_dir();

        if file_type.is_symlink() {
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => {
                    warn!("Skipping symbolic link to directory {:?}", entry.path());
                    return Ok(None);
                }
                Ok(_) => is_dir = false,
                Err(e) => {
                    warn!("Skipping dangling symbolic link {:?}: {}", entry.path(), e);
                    return Ok(None);
                }
            }
        }

        let path = relative_path(&self.root, entry.path(), is_dir)?;
        if path.as_str().contains(['\n', '\r']) {
            warn!("Skipping {:?}: line breaks in names are not supported", entry.path());
            return Ok(None);
        }

        Ok(Some(WalkEntry {
            path,
            full_path: entry.into_path(),
            is_dir,
        }))
    }
}

impl Iterator for DirWalker<'_> {
    type Item = Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Err(e) = self.cancel.check() {
                self.finished = true;
                return Some(Err(e));
            }
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            match self.convert(entry) {
                Ok(Some(walk_entry)) => return Some(Ok(walk_entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Relative path of `path` below `root`
fn relative_path(root: &Path, path: &Path, is_dir: bool) -> Result<RelPath> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| BackupError::internal(format!("{:?} is not below {:?}", path, root)))?;

    let mut segments = Vec::new();
    for component in relative.components() {
        match component.as_os_str().to_str() {
            Some(segment) => segments.push(segment),
            None => return Err(BackupError::NonUtf8Path(path.to_path_buf())),
        }
    }
    Ok(RelPath::from_segments(segments, is_dir))
}
