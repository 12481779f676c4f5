//! Backup part abstraction
//!
//! A backup part is the durable unit of change: an archive holding the bytes
//! of every path it adds plus a [`ChangeLog`] describing additions and
//! removals. Parts move through a fixed lifecycle:
//!
//! ```text
//! Empty (being written) ──close()──▶ Closed (read-only) ──▶ Merged away / Deleted
//! ```
//!
//! There is no way back from `Closed`. A part discovered on disk starts out
//! closed and must have [`BackupPart::read_changes`] called before its change
//! log can be used.
//!
//! [`crate::zip_part::ZipBackupPart`] is the only storage backend; the trait
//! keeps the orchestrator independent of it so tests can substitute their own.

use crate::cancel::CancelFlag;
use crate::error::Result;
use crate::types::{ChangeLog, PartId, RelPath};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::io::Read;
use std::path::Path;

/// Callback receiving archived entries from [`BackupPart::read_all`]
pub type EntryHandler<'h> = dyn FnMut(&RelPath, &mut dyn Read) -> Result<()> + 'h;

/// One incremental backup part
pub trait BackupPart: Send + Debug {
    /// Part name, derived from the creation time
    fn name(&self) -> &str;

    /// Creation time, whole seconds
    fn creation_time(&self) -> DateTime<Utc>;

    /// Opaque identity for error reporting
    fn id(&self) -> PartId;

    /// The change log, once written to or loaded by [`BackupPart::read_changes`]
    fn changes(&self) -> Option<&ChangeLog>;

    /// Register `path` as added, archiving the content of `source`
    ///
    /// Directories (paths ending in `/`) are archived as empty entries.
    ///
    /// # Errors
    ///
    /// - [`crate::BackupError::DuplicatePath`] if `path` is already registered
    /// - [`crate::BackupError::PartClosed`] after [`BackupPart::close`]
    /// - [`crate::BackupError::PartExists`] if the archive already exists on disk
    fn add_addition(&mut self, path: &RelPath, source: &Path) -> Result<()>;

    /// Register `path` as modified
    ///
    /// Modifications are stored exactly like additions.
    fn add_modification(&mut self, path: &RelPath, source: &Path) -> Result<()> {
        self.add_addition(path, source)
    }

    /// Register `path` as removed
    fn add_removal(&mut self, path: &RelPath) -> Result<()>;

    /// Fold `other` into this part, keeping this part's own entries
    ///
    /// `other` must have its change log loaded.
    ///
    /// # Errors
    ///
    /// - [`crate::BackupError::CorruptedPart`] if the archive and change log
    ///   of `other` disagree
    /// - [`crate::BackupError::Cancelled`] if `cancel` is raised between entries
    fn merge(&mut self, other: &dyn BackupPart, cancel: &CancelFlag) -> Result<()>;

    /// Persist the archive and the change log
    ///
    /// Must be called exactly once. A part without changes writes nothing.
    fn close(&mut self) -> Result<()>;

    /// Whether this part registers `path` as added
    ///
    /// With `compare_content`, the digest of `candidate` must also match the
    /// recorded digest. Directories match on presence alone.
    fn contains(&self, path: &RelPath, candidate: &Path, compare_content: bool) -> Result<bool>;

    /// Load and validate the change log from disk
    ///
    /// Idempotent. On failure the part forgets any loaded state so a later
    /// call reads the file again.
    ///
    /// # Errors
    ///
    /// - [`crate::BackupError::CorruptedPart`] if the log is missing or malformed
    fn read_changes(&mut self) -> Result<()>;

    /// Remove the archive and the change log
    ///
    /// Missing files are not an error.
    fn delete(&mut self) -> Result<()>;

    /// Stream every archived entry to `handler`, in archive order
    fn read_all(&self, handler: &mut EntryHandler<'_>) -> Result<()>;

    /// Whether this part has recorded any change
    fn is_empty(&self) -> bool {
        self.changes().map_or(true, |c| c.is_empty())
    }
}
