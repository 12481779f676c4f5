//! Backup orchestration
//!
//! [`IncrementalBackup`] drives the four operations on one source directory
//! and its storage root:
//!
//! - **backup**: reconstruct the current state from all parts, walk the
//!   source, and record additions, modifications and removals in a new part.
//! - **merge before**: collapse every part older than a threshold into one
//!   dated one second before the newest of them. A single qualifying part
//!   is left as it is, and a target name that is already taken by one of
//!   the parts is reported as [`BackupError::PartExists`].
//! - **merge by policy**: thin out history according to a
//!   [`RetentionPolicy`].
//! - **restore**: fold parts older than a threshold back into a full file set
//!   and stream it into a [`RestoreSink`].
//!
//! ## Failure handling
//!
//! Parts that fail validation while history is loaded are deleted and left
//! out; the operation carries on with the rest. Any other failure aborts the
//! operation and removes only what the operation itself was writing: the new
//! part of a backup or merge, or the sink output of a restore. Cancellation
//! follows the same path and is reported as [`BackupError::Cancelled`].
//!
//! The orchestrator does no locking. Callers must not run two operations
//! against the same storage root at once.
//!
//! ## Example
//!
//! ```rust,no_run
//! use backline::{Backup, IncrementalBackupBuilder, ZipRestoreSinkFactory};
//! use chrono::Utc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backup = IncrementalBackupBuilder::new()
//!     .ignore_path("world/session.lock")
//!     .build("./world", "./backups/world");
//!
//! let summary = backup.backup()?;
//! println!("{} changes recorded", summary.total_changes());
//!
//! backup.restore(Utc::now(), &ZipRestoreSinkFactory::new("./restores", Some("world".into())))?;
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelFlag;
use crate::error::{BackupError, Result, ResultExt};
use crate::factory::{PartFactory, ZipPartFactory};
use crate::ignore::IgnoreSet;
use crate::part::BackupPart;
use crate::restore::{RestoreSink, RestoreSinkFactory};
use crate::retention::RetentionPolicy;
use crate::state::ReconstructedState;
use crate::types::{BackupSummary, MergeSummary, RelPath, RestoreSummary, RetentionSummary};
use crate::utils::{format_part_time, truncate_to_secs};
use crate::walker::DirWalker;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Operations offered for one backed-up directory
pub trait Backup: Send + Sync {
    /// Record the changes since the last backup in a new part
    fn backup(&self) -> Result<BackupSummary>;

    /// Collapse every part created before `before` into one part
    fn merge_before(&self, before: DateTime<Utc>) -> Result<MergeSummary>;

    /// Thin out history according to `policy`, as seen at `now`
    fn merge_by_policy(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionSummary>;

    /// Restore the state as of the newest part created before `before`
    fn restore(&self, before: DateTime<Utc>, sinks: &dyn RestoreSinkFactory) -> Result<RestoreSummary>;

    /// The directory being backed up
    fn source_dir(&self) -> &Path;

    /// Creation times of all parts, oldest first
    fn restore_thresholds(&self) -> Result<Vec<DateTime<Utc>>>;

    /// Free bytes in the storage root, `-1` if unknown
    fn free_usable_space(&self) -> i64;

    /// Replace the set of ignored paths
    fn set_ignore_paths(&self, paths: BTreeSet<String>);

    /// The ignored paths
    fn ignore_paths(&self) -> BTreeSet<String>;
}

/// Incremental backup of one directory into one storage root
#[derive(Debug)]
pub struct IncrementalBackup {
    source: PathBuf,
    factory: Box<dyn PartFactory>,
    ignore: RwLock<IgnoreSet>,
    cancel: CancelFlag,
}

/// Builder for [`IncrementalBackup`]
#[derive(Debug, Default)]
pub struct IncrementalBackupBuilder {
    ignore_paths: Vec<String>,
    cancel: Option<CancelFlag>,
}

impl IncrementalBackupBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one ignored path; directories end in `/`
    pub fn ignore_path(mut self, path: impl Into<String>) -> Self {
        self.ignore_paths.push(path.into());
        self
    }

    /// Add several ignored paths
    pub fn ignore_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Share a cancellation flag with the caller
    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Back up `source` into zip parts under `storage`
    pub fn build(self, source: impl Into<PathBuf>, storage: impl Into<PathBuf>) -> IncrementalBackup {
        self.build_with_factory(source, Box::new(ZipPartFactory::new(storage)))
    }

    /// Back up `source` into parts produced by `factory`
    pub fn build_with_factory(
        self,
        source: impl Into<PathBuf>,
        factory: Box<dyn PartFactory>,
    ) -> IncrementalBackup {
        IncrementalBackup {
            source: source.into(),
            factory,
            ignore: RwLock::new(IgnoreSet::from_paths(&self.ignore_paths)),
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

/// Parts loaded for an operation, plus the corrupted ones that were dropped
struct LoadedParts {
    parts: Vec<Box<dyn BackupPart>>,
    corrupted: Vec<String>,
}

impl IncrementalBackup {
    /// Back up `source` into zip parts under `storage` with default settings
    pub fn new(source: impl Into<PathBuf>, storage: impl Into<PathBuf>) -> Self {
        IncrementalBackupBuilder::new().build(source, storage)
    }

    /// Directory holding the parts
    pub fn storage_root(&self) -> &Path {
        self.factory.storage_root()
    }

    /// The flag that cancels this backup's operations
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Like [`Backup::backup`], stamping the new part with `time`
    #[instrument(skip(self), fields(source = ?self.source))]
    pub fn backup_at(&self, time: DateTime<Utc>) -> Result<BackupSummary> {
        let time = truncate_to_secs(time);
        info!("Backing up {:?}", self.source);

        if !self.source.is_dir() {
            return Err(BackupError::SourceNotFound(self.source.clone()));
        }

        let ignore = self.ignore.read().clone();
        let loaded = self.load_parts(None).context("Failed to load backup parts")?;
        let state = ReconstructedState::fold(&loaded.parts, &ignore)?;
        debug!("Reconstructed {} paths from {} parts", state.len(), loaded.parts.len());

        let name = format_part_time(time);
        if loaded.parts.iter().any(|p| p.name() == name) {
            return Err(BackupError::PartExists(name));
        }

        let mut part = self.factory.create_new(time)?;
        let mut summary = BackupSummary {
            started_at: Some(time),
            corrupted_removed: loaded.corrupted,
            ..Default::default()
        };

        let outcome = self
            .record_changes(&loaded.parts, state, part.as_mut(), &ignore, &mut summary)
            .and_then(|()| part.close());
        if let Err(e) = outcome {
            self.discard_part(part.as_mut(), &e);
            return Err(e.context(format!("Failed to back up {:?}", self.source)));
        }

        if summary.total_changes() > 0 {
            summary.part = Some(part.name().to_string());
        }
        info!(
            "Backup of {:?} finished: {} added, {} modified, {} removed",
            self.source, summary.added, summary.modified, summary.removed
        );
        Ok(summary)
    }

    /// Walk the source and write the differences into `part`
    fn record_changes(
        &self,
        parts: &[Box<dyn BackupPart>],
        mut state: ReconstructedState,
        part: &mut dyn BackupPart,
        ignore: &IgnoreSet,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let walker = DirWalker::with_cancel(&self.source, ignore, self.cancel.clone());
        for entry in walker {
            let entry = entry?;
            match state.take(&entry.path) {
                None => {
                    part.add_addition(&entry.path, &entry.full_path)?;
                    summary.added += 1;
                }
                Some(owner) if !entry.is_dir => {
                    if !parts[owner].contains(&entry.path, &entry.full_path, true)? {
                        part.add_modification(&entry.path, &entry.full_path)?;
                        summary.modified += 1;
                    }
                }
                Some(_) => {}
            }
        }

        for path in state.into_paths() {
            self.cancel.check()?;
            part.add_removal(&path)?;
            summary.removed += 1;
        }
        Ok(())
    }

    /// Load parts created before `before`, dropping corrupted ones
    fn load_parts(&self, before: Option<DateTime<Utc>>) -> Result<LoadedParts> {
        let mut parts = Vec::new();
        let mut corrupted = Vec::new();

        for mut part in self.factory.read_all_before(before)? {
            self.cancel.check()?;
            match part.read_changes() {
                Ok(()) => parts.push(part),
                Err(e) if e.is_corruption() => {
                    warn!("Discarding corrupted backup part: {}", e);
                    part.delete()
                        .with_context(|| format!("Failed to delete corrupted backup part {}", part.name()))?;
                    corrupted.push(part.name().to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(LoadedParts { parts, corrupted })
    }

    /// Delete a part this operation was writing
    fn discard_part(&self, part: &mut dyn BackupPart, cause: &BackupError) {
        // the archive on disk belongs to someone else
        if matches!(cause.root(), BackupError::PartExists(_)) {
            return;
        }
        if let Err(e) = part.delete() {
            warn!("Failed to delete incomplete backup part {}: {}", part.name(), e);
        }
    }

    /// Merge `parts` (oldest first) into one new part dated `target`
    ///
    /// A source part found corrupted during the merge is deleted and the
    /// merge is retried without it.
    fn merge_parts(
        &self,
        mut parts: Vec<Box<dyn BackupPart>>,
        target: DateTime<Utc>,
    ) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();

        loop {
            if parts.len() < 2 {
                debug!("Fewer than two parts left to merge, nothing to do");
                return Ok(summary);
            }
            let name = format_part_time(target);
            if parts.iter().any(|p| p.name() == name) {
                return Err(BackupError::PartExists(name));
            }

            let mut merged = self.factory.create_new(target)?;
            match self.fold_into(merged.as_mut(), &parts) {
                Ok(()) => {
                    summary.target = Some(merged.name().to_string());
                    break;
                }
                Err(e) => {
                    self.discard_part(merged.as_mut(), &e);
                    let culprit = match e.part() {
                        Some(id) if e.is_corruption() => {
                            parts.iter().position(|p| p.name() == id.name)
                        }
                        _ => None,
                    };
                    let Some(index) = culprit else {
                        return Err(e.context(format!("Failed to merge into backup part {}", name)));
                    };
                    let mut corrupt = parts.remove(index);
                    warn!("Discarding corrupted backup part during merge: {}", e);
                    corrupt
                        .delete()
                        .with_context(|| format!("Failed to delete corrupted backup part {}", corrupt.name()))?;
                    summary.corrupted_removed.push(corrupt.name().to_string());
                }
            }
        }

        for part in parts.iter_mut() {
            let name = part.name().to_string();
            if let Err(e) = part.delete() {
                warn!("Failed to delete merged backup part {}: {}", name, e);
                summary.failed_deletes.push(name.clone());
            }
            summary.merged.push(name);
        }
        info!(
            "Merged {} parts into {}",
            summary.merged.len(),
            summary.target.as_deref().unwrap_or_default()
        );
        Ok(summary)
    }

    /// Merge `parts` newest to oldest into `target` and close it
    fn fold_into(&self, target: &mut dyn BackupPart, parts: &[Box<dyn BackupPart>]) -> Result<()> {
        for part in parts.iter().rev() {
            self.cancel.check()?;
            target.merge(part.as_ref(), &self.cancel)?;
        }
        target.close()
    }

    fn merge_before_unchecked(&self, before: DateTime<Utc>) -> Result<MergeSummary> {
        let loaded = self.load_parts(Some(before)).context("Failed to load backup parts")?;
        let Some(newest) = loaded.parts.last().map(|p| p.creation_time()) else {
            debug!("No parts before {}, nothing to merge", before);
            return Ok(MergeSummary {
                corrupted_removed: loaded.corrupted,
                ..Default::default()
            });
        };

        let mut summary = self.merge_parts(loaded.parts, newest - TimeDelta::seconds(1))?;
        let mut corrupted = loaded.corrupted;
        corrupted.append(&mut summary.corrupted_removed);
        summary.corrupted_removed = corrupted;
        Ok(summary)
    }

    fn check_not_future(&self, threshold: DateTime<Utc>) -> Result<()> {
        if threshold > Utc::now() {
            return Err(BackupError::ThresholdInFuture(threshold.to_rfc3339()));
        }
        Ok(())
    }

    /// Stream the surviving entries of `parts` into `sink`
    fn write_restore(
        &self,
        parts: &[Box<dyn BackupPart>],
        mut pending: Vec<BTreeSet<RelPath>>,
        sink: &mut dyn RestoreSink,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        sink.open()?;

        for (part, wanted) in parts.iter().zip(pending.iter_mut()).rev() {
            if wanted.is_empty() {
                continue;
            }
            debug!("Restoring {} entries from part {}", wanted.len(), part.name());
            part.read_all(&mut |path, content| {
                self.cancel.check()?;
                if wanted.remove(path) {
                    sink.add(path, content)?;
                    summary.entries_restored += 1;
                }
                Ok(())
            })?;
            if !wanted.is_empty() {
                return Err(BackupError::InconsistentPart {
                    part: part.id(),
                    missing: wanted.iter().map(|p| p.to_string()).collect(),
                });
            }
            summary.parts_read += 1;
        }

        sink.close()
    }
}

impl Backup for IncrementalBackup {
    fn backup(&self) -> Result<BackupSummary> {
        self.backup_at(Utc::now())
    }

    #[instrument(skip(self), fields(source = ?self.source))]
    fn merge_before(&self, before: DateTime<Utc>) -> Result<MergeSummary> {
        self.check_not_future(before)?;
        info!("Merging parts of {:?} created before {}", self.source, before);
        self.merge_before_unchecked(before)
    }

    #[instrument(skip(self, policy), fields(source = ?self.source))]
    fn merge_by_policy(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionSummary> {
        info!("Applying retention policy to {:?}: {}", self.source, policy);
        let mut summary = RetentionSummary::default();

        if let Some(horizon) = policy.horizon(now) {
            summary.horizon_merge = Some(self.merge_before_unchecked(horizon)?);
        }

        let loaded = self.load_parts(None).context("Failed to load backup parts")?;
        let times: Vec<DateTime<Utc>> = loaded.parts.iter().map(|p| p.creation_time()).collect();
        let groups = policy.plan(&times, now);
        debug!("Retention plan has {} merges over {} parts", groups.len(), times.len());

        let mut slots: Vec<Option<Box<dyn BackupPart>>> = loaded.parts.into_iter().map(Some).collect();
        for group in groups {
            self.cancel.check()?;
            let members: Vec<Box<dyn BackupPart>> =
                slots[group.range.clone()].iter_mut().filter_map(Option::take).collect();
            summary.band_merges.push(self.merge_parts(members, group.target)?);
        }

        summary.parts_remaining = self.factory.read_all_before(None)?.len();
        info!(
            "Retention merged {} parts, {} remain",
            summary.parts_merged(),
            summary.parts_remaining
        );
        Ok(summary)
    }

    #[instrument(skip(self, sinks), fields(source = ?self.source))]
    fn restore(&self, before: DateTime<Utc>, sinks: &dyn RestoreSinkFactory) -> Result<RestoreSummary> {
        self.check_not_future(before)?;
        info!("Restoring {:?} as of before {}", self.source, before);

        let ignore = self.ignore.read().clone();
        let loaded = self.load_parts(Some(before)).context("Failed to load backup parts")?;
        let Some(restore_time) = loaded.parts.last().map(|p| p.creation_time()) else {
            return Err(BackupError::NoBackupBefore(before.to_rfc3339()));
        };

        let mut pending = vec![BTreeSet::new(); loaded.parts.len()];
        let mut resolved: HashSet<&RelPath> = HashSet::new();
        for (index, part) in loaded.parts.iter().enumerate().rev() {
            let changes = part.changes().ok_or_else(|| {
                BackupError::internal(format!("change log of part {} was not loaded", part.name()))
            })?;
            for (path, change) in changes {
                if ignore.is_ignored(path) || !resolved.insert(path) {
                    continue;
                }
                if change.is_addition() {
                    pending[index].insert(path.clone());
                }
            }
        }

        let mut summary = RestoreSummary {
            restore_time: Some(restore_time),
            corrupted_removed: loaded.corrupted.clone(),
            ..Default::default()
        };
        let mut sink = sinks.create(restore_time)?;
        if let Err(e) = self.write_restore(&loaded.parts, pending, sink.as_mut(), &mut summary) {
            if let Err(delete_err) = sink.delete() {
                warn!("Failed to delete partial restore at {:?}: {}", sink.location(), delete_err);
            }
            return Err(e.context(format!("Failed to restore {:?}", self.source)));
        }

        info!(
            "Restored {} entries from {} parts into {:?}",
            summary.entries_restored,
            summary.parts_read,
            sink.location()
        );
        Ok(summary)
    }

    fn source_dir(&self) -> &Path {
        &self.source
    }

    fn restore_thresholds(&self) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .factory
            .read_all_before(None)?
            .iter()
            .map(|p| p.creation_time())
            .collect())
    }

    fn free_usable_space(&self) -> i64 {
        self.factory.free_usable_space()
    }

    fn set_ignore_paths(&self, paths: BTreeSet<String>) {
        *self.ignore.write() = IgnoreSet::from_paths(&paths);
    }

    fn ignore_paths(&self) -> BTreeSet<String> {
        self.ignore.read().entries().clone()
    }
}
