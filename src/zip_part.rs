//! Zip-backed backup parts
//!
//! Each part lives in the storage root as two files named after its creation
//! time: `{name}.zip` holds the archived content and `{name}.meta` holds the
//! change log. The archive is opened lazily on the first recorded change, so
//! a part that never records anything leaves no trace on disk. The change log
//! is written last, which makes a missing `.meta` next to a `.zip` a reliable
//! sign of an interrupted write.

use crate::cancel::CancelFlag;
use crate::change_log;
use crate::digest::{hash_file, ContentDigest, HashingReader};
use crate::error::{BackupError, Result};
use crate::part::{BackupPart, EntryHandler};
use crate::types::{Change, ChangeLog, PartId, RelPath};
use crate::utils::{atomic_write, format_part_time};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive file extension
pub const ARCHIVE_EXTENSION: &str = "zip";
/// Change log file extension
pub const META_EXTENSION: &str = "meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartState {
    Writable,
    Closed,
    Deleted,
}

/// Backup part stored as a zip archive plus a text change log
pub struct ZipBackupPart {
    dir: PathBuf,
    name: String,
    time: DateTime<Utc>,
    changes: Option<ChangeLog>,
    writer: Option<ZipWriter<BufWriter<File>>>,
    state: PartState,
}

impl ZipBackupPart {
    /// A new, empty part in `dir`
    ///
    /// Nothing touches the disk until the first change is recorded.
    pub fn create(dir: impl Into<PathBuf>, time: DateTime<Utc>) -> Self {
        Self {
            dir: dir.into(),
            name: format_part_time(time),
            time,
            changes: Some(ChangeLog::new()),
            writer: None,
            state: PartState::Writable,
        }
    }

    /// An existing, closed part in `dir`
    ///
    /// The change log is not read until [`BackupPart::read_changes`].
    pub fn open(dir: impl Into<PathBuf>, time: DateTime<Utc>) -> Self {
        Self {
            dir: dir.into(),
            name: format_part_time(time),
            time,
            changes: None,
            writer: None,
            state: PartState::Closed,
        }
    }

    /// Location of the archive
    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, ARCHIVE_EXTENSION))
    }

    /// Location of the change log
    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, META_EXTENSION))
    }

    /// Bytes used on disk by the archive and the change log
    pub fn size_on_disk(&self) -> u64 {
        [self.archive_path(), self.meta_path()]
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    fn has(&self, path: &RelPath) -> bool {
        self.changes.as_ref().is_some_and(|c| c.contains_key(path))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.state == PartState::Writable {
            Ok(())
        } else {
            Err(BackupError::PartClosed(self.name.clone()))
        }
    }

    fn check_new_entry(&self, path: &RelPath) -> Result<()> {
        self.ensure_writable()?;
        if self.has(path) {
            return Err(BackupError::DuplicatePath {
                part: self.name.clone(),
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn record(&mut self, path: RelPath, change: Change) {
        trace!("Part {}: {:?} {}", self.name, change.kind(), path);
        if let Some(changes) = self.changes.as_mut() {
            changes.insert(path, change);
        }
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<BufWriter<File>>> {
        if self.writer.is_none() {
            let path = self.archive_path();
            fs::create_dir_all(&self.dir).map_err(|e| BackupError::io_at(&self.dir, e))?;
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(BackupError::PartExists(self.name.clone()))
                }
                Err(e) => return Err(BackupError::io_at(&path, e)),
            };
            debug!("Opened archive {:?}", path);
            self.writer = Some(ZipWriter::new(BufWriter::new(file)));
        }
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(BackupError::internal("archive writer missing after open")),
        }
    }

    /// Archive one entry, returning the digest of file content
    fn write_entry(&mut self, path: &RelPath, content: &mut dyn Read) -> Result<Option<ContentDigest>> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(true);
        let writer = self.writer()?;

        if path.is_dir() {
            writer.add_directory(path.as_str(), options)?;
            return Ok(None);
        }

        writer.start_file(path.as_str(), options)?;
        let mut hashing = HashingReader::new(content);
        io::copy(&mut hashing, writer)?;
        let (digest, _) = hashing.finish();
        Ok(Some(digest))
    }

    fn remove_file(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::io_at(path, e)),
        }
    }
}

impl fmt::Debug for ZipBackupPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipBackupPart")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("changes", &self.changes.as_ref().map(|c| c.len()))
            .field("writing", &self.writer.is_some())
            .finish()
    }
}

impl BackupPart for ZipBackupPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.time
    }

    fn id(&self) -> PartId {
        PartId::new(self.name.clone(), self.archive_path())
    }

    fn changes(&self) -> Option<&ChangeLog> {
        self.changes.as_ref()
    }

    fn add_addition(&mut self, path: &RelPath, source: &Path) -> Result<()> {
        self.check_new_entry(path)?;
        let digest = if path.is_dir() {
            self.write_entry(path, &mut io::empty())?
        } else {
            let mut file = File::open(source).map_err(|e| BackupError::io_at(source, e))?;
            self.write_entry(path, &mut file)?
        };
        self.record(path.clone(), Change::Addition(digest));
        Ok(())
    }

    fn add_removal(&mut self, path: &RelPath) -> Result<()> {
        self.check_new_entry(path)?;
        self.writer()?;
        self.record(path.clone(), Change::Removal);
        Ok(())
    }

    fn merge(&mut self, other: &dyn BackupPart, cancel: &CancelFlag) -> Result<()> {
        self.ensure_writable()?;
        let other_changes = other.changes().ok_or_else(|| {
            BackupError::internal(format!("change log of part {} was not loaded", other.name()))
        })?;
        let other_id = other.id();
        debug!("Merging part {} into {}", other.name(), self.name);

        let mut pending: BTreeSet<&RelPath> = other_changes
            .iter()
            .filter(|(_, change)| change.is_addition())
            .map(|(path, _)| path)
            .collect();

        other.read_all(&mut |path, content| {
            cancel.check()?;
            let expected = match other_changes.get_key_value(path) {
                Some((key, Change::Addition(expected))) => {
                    if !pending.remove(key) {
                        return Err(BackupError::corrupted(
                            other_id.clone(),
                            format!("{} is archived twice", path),
                        ));
                    }
                    expected
                }
                Some((_, Change::Removal)) => {
                    return Err(BackupError::corrupted(
                        other_id.clone(),
                        format!("{} is archived but recorded as removed", path),
                    ))
                }
                None => {
                    return Err(BackupError::corrupted(
                        other_id.clone(),
                        format!("{} is archived but missing from the change log", path),
                    ))
                }
            };

            if self.has(path) {
                trace!("Keeping newer entry for {}", path);
                return Ok(());
            }
            let digest = self.write_entry(path, content)?;
            if digest != *expected {
                return Err(BackupError::corrupted(
                    other_id.clone(),
                    format!("content of {} does not match its recorded digest", path),
                ));
            }
            self.record(path.clone(), Change::Addition(digest));
            Ok(())
        })?;

        if !pending.is_empty() {
            return Err(BackupError::corrupted(
                other_id,
                format!("{} recorded additions are missing from the archive", pending.len()),
            ));
        }

        for (path, change) in other_changes {
            if let Change::Removal = change {
                cancel.check()?;
                if !self.has(path) {
                    self.writer()?;
                    self.record(path.clone(), Change::Removal);
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.state = PartState::Closed;

        let Some(writer) = self.writer.take() else {
            debug!("Part {} recorded no changes, nothing written", self.name);
            return Ok(());
        };

        let archive_path = self.archive_path();
        let mut file = writer.finish()?;
        file.flush().map_err(|e| BackupError::io_at(&archive_path, e))?;
        file.get_ref()
            .sync_all()
            .map_err(|e| BackupError::io_at(&archive_path, e))?;

        let changes = self
            .changes
            .as_ref()
            .ok_or_else(|| BackupError::internal("writable part without change log"))?;
        let text = change_log::render(changes, &self.name);
        atomic_write(&self.meta_path(), text.as_bytes())?;
        debug!("Closed part {} with {} changes", self.name, changes.len());
        Ok(())
    }

    fn contains(&self, path: &RelPath, candidate: &Path, compare_content: bool) -> Result<bool> {
        let changes = self.changes.as_ref().ok_or_else(|| {
            BackupError::internal(format!("change log of part {} was not loaded", self.name))
        })?;
        match changes.get(path) {
            Some(Change::Addition(recorded)) => {
                if !compare_content {
                    return Ok(true);
                }
                match recorded {
                    None => Ok(true),
                    Some(recorded) => Ok(hash_file(candidate)? == *recorded),
                }
            }
            _ => Ok(false),
        }
    }

    fn read_changes(&mut self) -> Result<()> {
        if self.changes.is_some() {
            return Ok(());
        }
        let meta_path = self.meta_path();
        let text = match fs::read_to_string(&meta_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::corrupted(self.id(), "change log is missing"))
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(BackupError::corrupted(self.id(), "change log is not valid UTF-8"))
            }
            Err(e) => return Err(BackupError::io_at(&meta_path, e)),
        };
        match change_log::parse(&text, &self.id()) {
            Ok(changes) => {
                self.changes = Some(changes);
                Ok(())
            }
            Err(e) => {
                self.changes = None;
                Err(e)
            }
        }
    }

    fn delete(&mut self) -> Result<()> {
        // drop the open archive handle before removing the file
        self.writer = None;
        self.state = PartState::Deleted;
        self.changes = None;
        Self::remove_file(&self.meta_path())?;
        Self::remove_file(&self.archive_path())?;
        debug!("Deleted part {}", self.name);
        Ok(())
    }

    fn read_all(&self, handler: &mut EntryHandler<'_>) -> Result<()> {
        let archive_path = self.archive_path();
        let file = match File::open(&archive_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::corrupted(self.id(), "archive is missing"))
            }
            Err(e) => return Err(BackupError::io_at(&archive_path, e)),
        };
        let mut archive = ZipArchive::new(BufReader::new(file))
            .map_err(|e| BackupError::corrupted(self.id(), format!("unreadable archive: {}", e)))?;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| BackupError::corrupted(self.id(), format!("unreadable entry: {}", e)))?;
            let path = RelPath::new(entry.name().to_string());
            handler(&path, &mut entry)?;
        }
        Ok(())
    }
}
