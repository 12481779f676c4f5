//! Restore sinks
//!
//! A restore writes reconstructed entries into a [`RestoreSink`] obtained
//! from a caller-supplied [`RestoreSinkFactory`]. The orchestrator opens the
//! sink, adds every surviving entry, and closes it; if anything fails it
//! calls [`RestoreSink::delete`] so no partial output is left behind.
//!
//! Two sinks ship with the crate:
//!
//! - [`ZipRestoreSink`] writes a single archive, optionally nesting every
//!   entry under a prefix directory such as the source directory's name.
//! - [`DirectoryRestoreSink`] materializes the tree in a fresh directory.

use crate::error::{BackupError, Result};
use crate::types::RelPath;
use crate::utils::format_part_time;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Destination of restored entries
pub trait RestoreSink: Send {
    /// Prepare the destination
    fn open(&mut self) -> Result<()>;

    /// Write one entry; directories arrive with an empty reader
    fn add(&mut self, path: &RelPath, content: &mut dyn Read) -> Result<()>;

    /// Finish writing
    fn close(&mut self) -> Result<()>;

    /// Remove everything written so far
    fn delete(&mut self) -> Result<()>;

    /// Where the output lives
    fn location(&self) -> &Path;
}

/// Creates a sink for each restore
pub trait RestoreSinkFactory: Send + Sync {
    /// A sink for a restore whose newest included part dates from `restore_time`
    fn create(&self, restore_time: DateTime<Utc>) -> Result<Box<dyn RestoreSink>>;
}

/// Restore into a zip archive
pub struct ZipRestoreSink {
    path: PathBuf,
    prefix: Option<String>,
    writer: Option<ZipWriter<BufWriter<File>>>,
}

impl ZipRestoreSink {
    /// Sink writing the archive at `path`
    ///
    /// With a `prefix`, every entry is stored as `prefix/entry`.
    pub fn new(path: impl Into<PathBuf>, prefix: Option<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.map(|p| p.trim_matches('/').to_string()).filter(|p| !p.is_empty()),
            writer: None,
        }
    }

    fn entry_name(&self, path: &RelPath) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, path),
            None => path.to_string(),
        }
    }
}

impl RestoreSink for ZipRestoreSink {
    fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io_at(parent, e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| BackupError::io_at(&self.path, e))?;
        self.writer = Some(ZipWriter::new(BufWriter::new(file)));
        debug!("Opened restore archive {:?}", self.path);
        Ok(())
    }

    fn add(&mut self, path: &RelPath, content: &mut dyn Read) -> Result<()> {
        let name = self.entry_name(path);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BackupError::internal("restore archive is not open"))?;
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(true);

        if path.is_dir() {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            io::copy(content, writer)?;
        }
        trace!("Restored {}", path);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| BackupError::internal("restore archive is not open"))?;
        let mut file = writer.finish()?;
        file.flush().map_err(|e| BackupError::io_at(&self.path, e))?;
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        self.writer = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::io_at(&self.path, e)),
        }
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

/// Creates [`ZipRestoreSink`]s named after the restore time
#[derive(Debug, Clone)]
pub struct ZipRestoreSinkFactory {
    out_dir: PathBuf,
    prefix: Option<String>,
}

impl ZipRestoreSinkFactory {
    /// Archives go to `out_dir/{restore time}.zip`
    pub fn new(out_dir: impl Into<PathBuf>, prefix: Option<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            prefix,
        }
    }
}

impl RestoreSinkFactory for ZipRestoreSinkFactory {
    fn create(&self, restore_time: DateTime<Utc>) -> Result<Box<dyn RestoreSink>> {
        let path = self.out_dir.join(format!("{}.zip", format_part_time(restore_time)));
        Ok(Box::new(ZipRestoreSink::new(path, self.prefix.clone())))
    }
}

/// Restore into a new directory tree
#[derive(Debug)]
pub struct DirectoryRestoreSink {
    root: PathBuf,
    created: bool,
}

impl DirectoryRestoreSink {
    /// Sink creating the tree at `root`, which must not exist yet
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created: false,
        }
    }
}

impl RestoreSink for DirectoryRestoreSink {
    fn open(&mut self) -> Result<()> {
        if self.root.exists() {
            return Err(BackupError::io_at(
                &self.root,
                io::Error::new(io::ErrorKind::AlreadyExists, "restore directory already exists"),
            ));
        }
        fs::create_dir_all(&self.root).map_err(|e| BackupError::io_at(&self.root, e))?;
        self.created = true;
        Ok(())
    }

    fn add(&mut self, path: &RelPath, content: &mut dyn Read) -> Result<()> {
        if !path.is_contained() {
            return Err(BackupError::internal(format!("refusing to restore {} outside the target", path)));
        }
        let target = path.to_path(&self.root);
        if path.is_dir() {
            fs::create_dir_all(&target).map_err(|e| BackupError::io_at(&target, e))?;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io_at(parent, e))?;
        }
        let mut file = File::create(&target).map_err(|e| BackupError::io_at(&target, e))?;
        io::copy(content, &mut file).map_err(|e| BackupError::io_at(&target, e))?;
        trace!("Restored {}", path);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        if self.created && self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| BackupError::io_at(&self.root, e))?;
        }
        self.created = false;
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.root
    }
}

/// Creates [`DirectoryRestoreSink`]s named after the restore time
#[derive(Debug, Clone)]
pub struct DirectoryRestoreSinkFactory {
    out_dir: PathBuf,
}

impl DirectoryRestoreSinkFactory {
    /// Trees go to `out_dir/{restore time}/`
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl RestoreSinkFactory for DirectoryRestoreSinkFactory {
    fn create(&self, restore_time: DateTime<Utc>) -> Result<Box<dyn RestoreSink>> {
        Ok(Box::new(DirectoryRestoreSink::new(
            self.out_dir.join(format_part_time(restore_time)),
        )))
    }
}
