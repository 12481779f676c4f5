//! Multi-target backup runs
//!
//! A [`BackupRunner`] performs one scheduled pass over every target in a
//! [`BackupConfig`]: it checks free space in the storage root, then for each
//! target merges old history (by retention policy when one is configured,
//! otherwise everything older than the maximum backup age) and takes a new
//! backup. Targets run side by side on the rayon pool.
//!
//! A failing target does not stop the others. Each outcome is reported in
//! the returned [`RunReport`].

use crate::backup::{Backup, IncrementalBackup, IncrementalBackupBuilder};
use crate::cancel::CancelFlag;
use crate::config::{BackupConfig, TargetConfig};
use crate::error::{BackupError, Result};
use crate::types::BackupSummary;
use crate::utils::{format_bytes, usable_space};
use chrono::{DateTime, TimeDelta, Utc};
use rayon::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Result of one target
#[derive(Debug, Clone)]
pub enum TargetOutcome {
    /// Backup finished
    Completed(BackupSummary),
    /// Backup failed with the given message
    Failed(String),
    /// The run was cancelled before the target finished
    Cancelled,
}

/// Report for one target
#[derive(Debug, Clone)]
pub struct TargetReport {
    /// Storage folder name
    pub name: String,
    /// Directory backed up
    pub source: PathBuf,
    /// How the backup went
    pub outcome: TargetOutcome,
    /// Error of the merge preceding the backup, if it failed
    pub merge_error: Option<String>,
    /// Time spent on the target
    pub elapsed: Duration,
}

impl TargetReport {
    /// Whether the backup completed
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Completed(_))
    }
}

/// Report of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// One report per target, in configuration order
    pub targets: Vec<TargetReport>,
    /// Set when the run was skipped for lack of free space
    pub skipped_low_space: bool,
    /// Wall time of the run
    pub elapsed: Duration,
}

impl RunReport {
    /// Targets whose backup did not complete
    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| !t.succeeded())
    }

    /// Whether every target completed
    pub fn all_succeeded(&self) -> bool {
        !self.skipped_low_space && self.failures().next().is_none()
    }
}

/// Runs backups for every configured target
#[derive(Debug)]
pub struct BackupRunner {
    config: BackupConfig,
    cancel: CancelFlag,
}

impl BackupRunner {
    /// Runner for `config`
    pub fn new(config: BackupConfig) -> Self {
        Self::with_cancel(config, CancelFlag::new())
    }

    /// Runner sharing a cancellation flag with the caller
    pub fn with_cancel(config: BackupConfig, cancel: CancelFlag) -> Self {
        Self { config, cancel }
    }

    /// The configuration being run
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Flag that cancels the run
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Build the backup of one target
    ///
    /// # Errors
    ///
    /// - [`BackupError::IoAt`] if the target's ignore file cannot be read
    pub fn backup_for(&self, target: &TargetConfig) -> Result<IncrementalBackup> {
        Ok(IncrementalBackupBuilder::new()
            .ignore_paths(target.ignore_paths()?)
            .cancel_flag(self.cancel.clone())
            .build(&target.source, self.config.storage_dir(target)))
    }

    /// Look up a target by storage folder name
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.config.targets.iter().find(|t| t.name() == name)
    }

    /// Run every target once, as of now
    pub fn run(&self) -> Result<RunReport> {
        self.run_at(Utc::now())
    }

    /// Run every target once, as of `now`
    ///
    /// # Errors
    ///
    /// - [`BackupError::IoAt`] if the storage root cannot be created
    #[instrument(skip(self, now), fields(targets = self.config.targets.len()))]
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let start = Instant::now();
        let root = &self.config.storage_root;
        fs::create_dir_all(root).map_err(|e| BackupError::io_at(root, e))?;

        let free = usable_space(root);
        let required = self.config.min_free_space_bytes();
        if free >= 0 && free < required {
            warn!(
                "Only {} free in {:?}, {} required; skipping backups",
                format_bytes(free as u64),
                root,
                format_bytes(required as u64)
            );
            return Ok(RunReport {
                skipped_low_space: true,
                elapsed: start.elapsed(),
                ..Default::default()
            });
        }

        let workers = self.config.worker_count();
        info!("Backing up {} targets with {} workers", self.config.targets.len(), workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| BackupError::internal(format!("failed to start worker pool: {}", e)))?;

        let targets: Vec<TargetReport> = pool.install(|| {
            self.config
                .targets
                .par_iter()
                .map(|target| self.run_target(target, now))
                .collect()
        });

        let report = RunReport {
            targets,
            skipped_low_space: false,
            elapsed: start.elapsed(),
        };
        info!(
            "Backup run finished in {:?}: {} of {} targets succeeded",
            report.elapsed,
            report.targets.iter().filter(|t| t.succeeded()).count(),
            report.targets.len()
        );
        Ok(report)
    }

    fn run_target(&self, target: &TargetConfig, now: DateTime<Utc>) -> TargetReport {
        let start = Instant::now();
        let mut report = TargetReport {
            name: target.name(),
            source: target.source.clone(),
            outcome: TargetOutcome::Cancelled,
            merge_error: None,
            elapsed: Duration::ZERO,
        };
        if self.cancel.is_cancelled() {
            return report;
        }

        let backup = match self.backup_for(target) {
            Ok(backup) => backup,
            Err(e) => {
                error!("Failed to prepare backup of {}: {}", report.name, e);
                report.outcome = TargetOutcome::Failed(e.user_message());
                report.elapsed = start.elapsed();
                return report;
            }
        };

        if let Err(e) = self.merge_history(&backup, now) {
            if e.is_cancelled() {
                report.elapsed = start.elapsed();
                return report;
            }
            warn!("Failed to merge history of {}: {}", report.name, e);
            report.merge_error = Some(e.user_message());
        }

        report.outcome = match backup.backup_at(now) {
            Ok(summary) => TargetOutcome::Completed(summary),
            Err(e) if e.is_cancelled() => TargetOutcome::Cancelled,
            Err(e) => {
                error!("Backup of {} failed: {}", report.name, e);
                TargetOutcome::Failed(e.user_message())
            }
        };
        report.elapsed = start.elapsed();
        report
    }

    fn merge_history(&self, backup: &IncrementalBackup, now: DateTime<Utc>) -> Result<()> {
        match &self.config.retention {
            Some(policy) => backup.merge_by_policy(policy, now).map(|_| ()),
            None => {
                let age = TimeDelta::from_std(self.config.max_backup_age())
                    .map_err(|e| BackupError::InvalidConfiguration(format!("max backup age: {}", e)))?;
                let threshold = now - age;
                // merge_before refuses thresholds after the wall clock
                if threshold > Utc::now() {
                    return Ok(());
                }
                backup.merge_before(threshold).map(|_| ())
            }
        }
    }
}
