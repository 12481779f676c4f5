//! Backup part discovery and creation
//!
//! A [`PartFactory`] owns one storage root. It hands out new parts and lists
//! existing ones oldest first, without validating them; validation is up to
//! the caller via [`BackupPart::read_changes`].

use crate::error::{BackupError, Result};
use crate::part::BackupPart;
use crate::utils::{parse_part_time, truncate_to_secs, usable_space};
use crate::zip_part::{ZipBackupPart, ARCHIVE_EXTENSION};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Source of backup parts for one storage root
pub trait PartFactory: Send + Sync + Debug {
    /// A new, empty part named after `time`, truncated to whole seconds
    ///
    /// Name collisions are not checked here.
    fn create_new(&self, time: DateTime<Utc>) -> Result<Box<dyn BackupPart>>;

    /// Existing parts created strictly before `before`, oldest first
    ///
    /// `None` lists every part. A missing storage root yields an empty list.
    fn read_all_before(&self, before: Option<DateTime<Utc>>) -> Result<Vec<Box<dyn BackupPart>>>;

    /// Free bytes in the storage root, `-1` if unknown
    fn free_usable_space(&self) -> i64;

    /// Directory the parts live in
    fn storage_root(&self) -> &Path;
}

/// Factory for [`ZipBackupPart`]s in one directory
#[derive(Debug, Clone)]
pub struct ZipPartFactory {
    root: PathBuf,
}

impl ZipPartFactory {
    /// Factory for parts stored in `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creation times of the parts in the storage root, oldest first
    pub fn part_times(&self) -> Result<Vec<DateTime<Utc>>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::io_at(&self.root, e)),
        };

        let mut times = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| BackupError::io_at(&self.root, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match parse_part_time(stem) {
                Some(time) => times.push(time),
                None => trace!("Ignoring unrelated archive {:?}", path),
            }
        }
        times.sort();
        Ok(times)
    }
}

impl PartFactory for ZipPartFactory {
    fn create_new(&self, time: DateTime<Utc>) -> Result<Box<dyn BackupPart>> {
        Ok(Box::new(ZipBackupPart::create(&self.root, truncate_to_secs(time))))
    }

    fn read_all_before(&self, before: Option<DateTime<Utc>>) -> Result<Vec<Box<dyn BackupPart>>> {
        let parts: Vec<Box<dyn BackupPart>> = self
            .part_times()?
            .into_iter()
            .filter(|time| before.map_or(true, |before| *time < before))
            .map(|time| Box::new(ZipBackupPart::open(&self.root, time)) as Box<dyn BackupPart>)
            .collect();
        debug!("Found {} parts in {:?}", parts.len(), self.root);
        Ok(parts)
    }

    fn free_usable_space(&self) -> i64 {
        usable_space(&self.root)
    }

    fn storage_root(&self) -> &Path {
        &self.root
    }
}
