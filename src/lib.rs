//! # Backline - Incremental directory backups
//!
//! An incremental, content-addressed backup engine for directory trees with
//! merge, tiered retention and point-in-time restore.
//!
//! ## Overview
//!
//! Backline records a directory as a chain of **parts**. Each part holds
//! only what changed since the state reconstructed from all older parts:
//! - Create a new part holding additions, modifications and removals
//! - Collapse every part older than a threshold into one part
//! - Thin out history with a tiered retention policy
//! - Restore the directory as it was at any recorded point in time
//! - Run backups for many directories from one configuration file
//!
//! ## Architecture
//!
//! - **Parts**: a `{storage}/{yyyy-MM-dd HH-mm-ss}.zip` archive of added
//!   entries plus a `.meta` change log. Part names are UTC creation times, so
//!   their lexical order is their age order.
//! - **Content digests**: every added file is stored with the SHA-256 of its
//!   bytes. Comparing digests decides whether a file was modified and
//!   verifies archives against their change logs during merges.
//! - **Reconstruction**: folding parts newest to oldest gives each path its
//!   owning part. A removal in a newer part shadows every older addition.
//! - **Corruption recovery**: a part whose change log is missing, malformed or
//!   disagrees with its archive is deleted and left out. The history loses
//!   that part but stays usable.
//! - **Parallel targets**: [`BackupRunner`] runs several configured
//!   directories side by side on a rayon pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backline::{Backup, IncrementalBackup, ZipRestoreSinkFactory};
//! use chrono::{TimeDelta, Utc};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backup = IncrementalBackup::new("./world", "./backups/world");
//!
//! // Record what changed since the last part
//! let summary = backup.backup()?;
//! println!("{} added, {} modified, {} removed", summary.added, summary.modified, summary.removed);
//!
//! // Collapse everything older than three weeks
//! backup.merge_before(Utc::now() - TimeDelta::weeks(3))?;
//!
//! // Restore the newest state into ./restores/{time}.zip
//! let restored = backup.restore(Utc::now(), &ZipRestoreSinkFactory::new("./restores", None))?;
//! println!("Restored {} entries", restored.entries_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Retention
//!
//! ```rust,no_run
//! use backline::{Backup, IncrementalBackup, RetentionBand, RetentionPolicy};
//! use chrono::Utc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Hourly parts for a day, daily parts for a month, one part before that
//! let policy = RetentionPolicy::new(vec![
//!     "1h:1day".parse::<RetentionBand>()?,
//!     "1day:30days".parse::<RetentionBand>()?,
//! ])?;
//!
//! let backup = IncrementalBackup::new("./world", "./backups/world");
//! let summary = backup.merge_by_policy(&policy, Utc::now())?;
//! println!("Merged {} parts, {} remain", summary.parts_merged(), summary.parts_remaining);
//! # Ok(())
//! # }
//! ```
//!
//! ## Scheduled runs
//!
//! ```rust,no_run
//! use backline::{BackupConfig, BackupRunner};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackupConfig::load(Path::new("backline.json"))?;
//! let report = BackupRunner::new(config).run()?;
//! for failed in report.failures() {
//!     eprintln!("{} failed: {:?}", failed.name, failed.outcome);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Operations on one storage root must not overlap; nothing here locks the
//! storage root. Different storage roots are independent. Long operations
//! poll a [`CancelFlag`] and clean up their partial output when it is
//! raised.
//!
//! ## Module Organization
//!
//! - [`backup`]: The orchestrator and the [`Backup`] trait
//! - [`part`] / [`zip_part`]: Part abstraction and its zip implementation
//! - [`factory`]: Part discovery and creation
//! - [`change_log`]: The `.meta` text format
//! - [`retention`]: Tiered retention policies
//! - [`restore`]: Restore sinks
//! - [`ignore`]: Ignored-path matching
//! - [`config`] / [`runner`]: Multi-target configuration and runs
//! - [`types`] / [`error`]: Shared types and errors

pub mod backup;
pub mod cancel;
pub mod change_log;
pub mod config;
pub mod digest;
pub mod error;
pub mod factory;
pub mod ignore;
pub mod part;
pub mod restore;
pub mod retention;
pub mod runner;
pub mod state;
pub mod types;
pub mod utils;
pub mod walker;
pub mod zip_part;

// Re-export main types for convenience
pub use backup::{Backup, IncrementalBackup, IncrementalBackupBuilder};
pub use cancel::CancelFlag;
pub use config::{BackupConfig, TargetConfig};
pub use digest::ContentDigest;
pub use error::{BackupError, Result};
pub use factory::{PartFactory, ZipPartFactory};
pub use ignore::IgnoreSet;
pub use part::BackupPart;
pub use restore::{
    DirectoryRestoreSink, DirectoryRestoreSinkFactory, RestoreSink, RestoreSinkFactory,
    ZipRestoreSink, ZipRestoreSinkFactory,
};
pub use retention::{MergeGroup, RetentionBand, RetentionPolicy};
pub use runner::{BackupRunner, RunReport, TargetOutcome, TargetReport};
pub use types::*;
pub use zip_part::ZipBackupPart;
