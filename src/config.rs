//! Runner configuration
//!
//! A [`BackupConfig`] is loaded from a JSON file:
//!
//! ```json
//! {
//!   "storage_root": "backups",
//!   "restore_dir": "restores",
//!   "max_backup_age_secs": 1814400,
//!   "min_free_space_mb": 1000,
//!   "retention": [
//!     { "interval": 3600, "duration": 86400 },
//!     { "interval": 86400, "duration": -1 }
//!   ],
//!   "targets": [
//!     { "source": "/srv/world", "ignore": ["session.lock"], "ignore_file": "world.ignore" }
//!   ]
//! }
//! ```
//!
//! Relative paths resolve against the directory holding the configuration
//! file. Values that are out of range are replaced by their defaults with a
//! warning rather than rejected.

use crate::error::{BackupError, Result};
use crate::ignore::load_ignore_file;
use crate::retention::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default maximum age of a part before it is merged: 21 days
pub const DEFAULT_MAX_BACKUP_AGE_SECS: u64 = 21 * 24 * 3600;
/// Smallest accepted maximum age
pub const MIN_MAX_BACKUP_AGE_SECS: u64 = 3600;
/// Default free space required before backing up
pub const DEFAULT_MIN_FREE_SPACE_MB: u64 = 1000;

/// One directory to back up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Directory to back up
    pub source: PathBuf,
    /// Name of the target's folder in the storage root; defaults to the
    /// source directory's name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ignored paths relative to `source`; directories end in `/`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
    /// File listing more ignored paths, one per line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_file: Option<PathBuf>,
}

impl TargetConfig {
    /// Target for `source` with no ignored paths
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            name: None,
            ignore: Vec::new(),
            ignore_file: None,
        }
    }

    /// Folder name in the storage root
    pub fn name(&self) -> String {
        self.name
            .clone()
            .or_else(|| {
                self.source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "target".to_string())
    }

    /// Inline ignore entries plus those of the ignore file
    ///
    /// # Errors
    ///
    /// - [`BackupError::IoAt`] if the ignore file cannot be read
    pub fn ignore_paths(&self) -> Result<Vec<String>> {
        let mut paths = self.ignore.clone();
        if let Some(file) = &self.ignore_file {
            let from_file = load_ignore_file(file)?;
            debug!("Loaded {} ignore entries from {:?}", from_file.len(), file);
            paths.extend(from_file);
        }
        Ok(paths)
    }
}

/// Configuration of a multi-target backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root under which every target gets its own folder of parts
    pub storage_root: PathBuf,
    /// Where restores are written
    pub restore_dir: PathBuf,
    /// Directories to back up
    pub targets: Vec<TargetConfig>,
    /// Parts older than this are merged before each backup
    pub max_backup_age_secs: u64,
    /// Skip the run when less free space than this remains
    pub min_free_space_mb: u64,
    /// Retention policy; replaces the age-based merge when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
    /// Worker threads for running targets side by side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_targets: Option<usize>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("backups"),
            restore_dir: PathBuf::from("restores"),
            targets: Vec::new(),
            max_backup_age_secs: DEFAULT_MAX_BACKUP_AGE_SECS,
            min_free_space_mb: DEFAULT_MIN_FREE_SPACE_MB,
            retention: None,
            parallel_targets: None,
        }
    }
}

impl BackupConfig {
    /// Load, resolve and validate a configuration file
    ///
    /// # Errors
    ///
    /// - [`BackupError::IoAt`] if the file cannot be read
    /// - [`BackupError::Json`] if it is not valid configuration JSON
    /// - [`BackupError::InvalidConfiguration`] if targets clash
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| BackupError::io_at(path, e))?;
        let mut config: BackupConfig = serde_json::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| BackupError::io_at(path, e))
    }

    /// Make relative paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.storage_root);
        resolve(&mut self.restore_dir);
        for target in &mut self.targets {
            resolve(&mut target.source);
            if let Some(file) = target.ignore_file.as_mut() {
                resolve(file);
            }
        }
    }

    /// Replace out-of-range values with defaults and check targets
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] if two targets share a name
    pub fn validate(&mut self) -> Result<()> {
        if self.max_backup_age_secs < MIN_MAX_BACKUP_AGE_SECS {
            warn!(
                "max_backup_age_secs must be at least {}, got {}; using {}",
                MIN_MAX_BACKUP_AGE_SECS, self.max_backup_age_secs, DEFAULT_MAX_BACKUP_AGE_SECS
            );
            self.max_backup_age_secs = DEFAULT_MAX_BACKUP_AGE_SECS;
        }
        if self.parallel_targets == Some(0) {
            warn!("parallel_targets must be at least 1; using the number of CPUs");
            self.parallel_targets = None;
        }
        if self.targets.is_empty() {
            warn!("No backup targets configured");
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            let name = target.name();
            if !names.insert(name.clone()) {
                return Err(BackupError::InvalidConfiguration(format!(
                    "two targets share the storage folder '{}'; set distinct names",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Maximum part age
    pub fn max_backup_age(&self) -> Duration {
        Duration::from_secs(self.max_backup_age_secs)
    }

    /// Required free space in bytes
    pub fn min_free_space_bytes(&self) -> i64 {
        i64::try_from(self.min_free_space_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }

    /// Worker count for the runner
    pub fn worker_count(&self) -> usize {
        self.parallel_targets
            .unwrap_or_else(num_cpus::get)
            .min(self.targets.len().max(1))
    }

    /// Storage folder of `target`
    pub fn storage_dir(&self, target: &TargetConfig) -> PathBuf {
        self.storage_root.join(target.name())
    }
}
