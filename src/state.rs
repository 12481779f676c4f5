//! Reconstructed state
//!
//! Folding a run of parts newest to oldest yields, for every path, the part
//! that currently owns it: the newest addition not shadowed by a newer
//! removal. Paths whose newest verdict is a removal, and ignored paths, are
//! absent.

use crate::error::{BackupError, Result};
use crate::ignore::IgnoreSet;
use crate::part::BackupPart;
use crate::types::{Change, RelPath};
use std::collections::{BTreeMap, HashSet};

/// Map from path to the index of the owning part
#[derive(Debug, Clone, Default)]
pub struct ReconstructedState {
    owners: BTreeMap<RelPath, usize>,
}

impl ReconstructedState {
    /// Fold `parts` (oldest first) newest to oldest
    ///
    /// Owner indices refer to positions in `parts`.
    ///
    /// # Errors
    ///
    /// - [`BackupError::Internal`] if a part's change log was not loaded
    pub fn fold(parts: &[Box<dyn BackupPart>], ignore: &IgnoreSet) -> Result<Self> {
        let mut owners = BTreeMap::new();
        let mut resolved: HashSet<&RelPath> = HashSet::new();

        for (index, part) in parts.iter().enumerate().rev() {
            let changes = part.changes().ok_or_else(|| {
                BackupError::internal(format!("change log of part {} was not loaded", part.name()))
            })?;
            for (path, change) in changes {
                if ignore.is_ignored(path) || !resolved.insert(path) {
                    continue;
                }
                if let Change::Addition(_) = change {
                    owners.insert(path.clone(), index);
                }
            }
        }

        Ok(Self { owners })
    }

    /// Index of the part owning `path`
    pub fn owner(&self, path: &RelPath) -> Option<usize> {
        self.owners.get(path).copied()
    }

    /// Remove `path`, returning its owner
    pub fn take(&mut self, path: &RelPath) -> Option<usize> {
        self.owners.remove(path)
    }

    /// Paths still present, in path order
    pub fn paths(&self) -> impl Iterator<Item = &RelPath> {
        self.owners.keys()
    }

    /// Consume the state, yielding the remaining paths
    pub fn into_paths(self) -> impl Iterator<Item = RelPath> {
        self.owners.into_keys()
    }

    /// Number of owned paths
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Whether no path is owned
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
