//! Error types for the backline engine
//!
//! This module defines all error types that can occur while backing up,
//! merging, or restoring. Errors carry enough context to tell storage faults
//! apart from corrupted parts and from intentional cancellation, so callers
//! can decide whether to retry, repair, or stay quiet.

use crate::types::PartId;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the backline library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all backline operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error tied to a specific path
    #[error("IO error at {path:?}: {source}")]
    IoAt {
        /// Path the operation was working on
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Errors raised by the archive reader or writer
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A part's change log or archive failed validation
    #[error("Corrupted backup part {part}: {reason}")]
    CorruptedPart {
        /// Identity of the offending part
        part: PartId,
        /// What failed to validate
        reason: String,
    },

    /// A part's archive lacks entries its own change log promises
    #[error("Backup part {part} is inconsistent with its change log ({} missing entries)", .missing.len())]
    InconsistentPart {
        /// Identity of the offending part
        part: PartId,
        /// Paths recorded as additions but absent from the archive
        missing: Vec<String>,
    },

    /// A part with the requested name already exists
    #[error("Backup part already exists: {0}")]
    PartExists(String),

    /// Write attempted on a part that was already closed
    #[error("Backup part {0} is closed")]
    PartClosed(String),

    /// The same path was registered twice in one part
    #[error("Path {path} registered twice in backup part {part}")]
    DuplicatePath {
        /// Name of the part being written
        part: String,
        /// The duplicated relative path
        path: String,
    },

    /// The backup source directory is missing
    #[error("Source directory not found: {0:?}")]
    SourceNotFound(PathBuf),

    /// No backup exists before the requested threshold
    #[error("No backup exists before {0}")]
    NoBackupBefore(String),

    /// A merge or restore threshold lies in the future
    #[error("Threshold {0} lies in the future")]
    ThresholdInFuture(String),

    /// A file name could not be represented as UTF-8
    #[error("Path is not valid UTF-8: {0:?}")]
    NonUtf8Path(PathBuf),

    /// Retention policy could not be interpreted
    #[error("Invalid retention policy: {0}")]
    InvalidPolicy(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The operation observed a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// A backup, merge, or restore failed; wraps the underlying cause
    #[error("{context}: {source}")]
    Failed {
        /// What the operation was doing
        context: String,
        /// Underlying cause
        #[source]
        source: Box<BackupError>,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create a corruption error for `part`
    pub fn corrupted(part: PartId, reason: impl Into<String>) -> Self {
        BackupError::CorruptedPart {
            part,
            reason: reason.into(),
        }
    }

    /// Attach a path to an I/O error
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Wrap this error with a description of the failed operation
    pub fn context(self, context: impl Into<String>) -> Self {
        BackupError::Failed {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through operation wrappers
    pub fn root(&self) -> &BackupError {
        match self {
            BackupError::Failed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error indicates a corrupted part
    pub fn is_corruption(&self) -> bool {
        matches!(
            self.root(),
            BackupError::CorruptedPart { .. } | BackupError::InconsistentPart { .. }
        )
    }

    /// Check if this error came from a cancellation request
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), BackupError::Cancelled)
    }

    /// Check if retrying the operation later might succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            BackupError::Io(_)
                | BackupError::IoAt { .. }
                | BackupError::PartExists(_)
                | BackupError::Cancelled
        )
    }

    /// The part this error refers to, if any
    pub fn part(&self) -> Option<&PartId> {
        match self.root() {
            BackupError::CorruptedPart { part, .. } | BackupError::InconsistentPart { part, .. } => {
                Some(part)
            }
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self.root() {
            BackupError::SourceNotFound(path) => {
                format!("Source directory {:?} does not exist. Check the target configuration.", path)
            }
            BackupError::NoBackupBefore(when) => {
                format!("No backup was taken before {}. Use 'list' to see available restore points.", when)
            }
            BackupError::CorruptedPart { part, reason } => {
                format!(
                    "Backup part {} is corrupted ({}). It will be removed by the next backup run.",
                    part, reason
                )
            }
            BackupError::PartExists(name) => {
                format!("A backup part named '{}' already exists. Wait a second and try again.", name)
            }
            BackupError::Cancelled => "Operation cancelled.".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Extension for attaching operation context to results
pub trait ResultExt<T> {
    /// Wrap the error, if any, in [`BackupError::Failed`]
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Like [`ResultExt::context`] but builds the message lazily
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<BackupError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err: BackupError = e.into();
            err.context(context)
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| {
            let err: BackupError = e.into();
            err.context(f())
        })
    }
}
