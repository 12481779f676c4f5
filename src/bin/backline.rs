//! # Backline CLI - Incremental backups from the command line
//!
//! A command-line interface for the backline library.
//!
//! ## Features
//! - Take incremental backups of a directory
//! - Merge old history, by threshold or by retention policy
//! - Restore any recorded point in time into a zip archive or a directory
//! - Run every target of a configuration file in one go
//!
//! ## Usage
//! ```bash
//! # Back up ./world into ./backups/world
//! backline --source world --storage backups/world backup
//!
//! # List restore points
//! backline --source world --storage backups/world list
//!
//! # Restore the state before a given time
//! backline --source world --storage backups/world restore --before "2024-05-01 12-00-00" --out restores
//!
//! # Keep hourly parts for a day and daily parts for a month
//! backline --source world --storage backups/world retain --band 1h:1day --band 1day:30days
//!
//! # Run every configured target
//! backline run --config backline.json
//! ```

use anyhow::{bail, Context};
use backline::utils::{format_bytes, format_part_time, parse_time_arg};
use backline::{
    Backup, BackupConfig, BackupError, BackupRunner, DirectoryRestoreSinkFactory, IncrementalBackup,
    IncrementalBackupBuilder, RestoreSinkFactory, RetentionBand, RetentionPolicy, TargetOutcome,
    ZipBackupPart, ZipRestoreSinkFactory,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Backline CLI - Incremental, content-addressed directory backups
#[derive(Parser)]
#[command(name = "backline")]
#[command(version)]
#[command(about = "Incremental directory backups with merge, retention and point-in-time restore")]
#[command(long_about = None)]
struct Cli {
    /// Directory to back up (defaults to current)
    #[arg(short = 'p', long, global = true)]
    source: Option<PathBuf>,

    /// Storage directory for backup parts (defaults to ./backups)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Paths to ignore, relative to the source; directories end in '/'
    #[arg(short, long, global = true)]
    ignore: Vec<String>,

    /// File listing paths to ignore, one per line
    #[arg(long, global = true)]
    ignore_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every target of a configuration file
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Record the changes since the last backup
    #[command(alias = "b")]
    Backup {
        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Collapse every part created before a point in time
    Merge {
        /// Threshold (RFC 3339, 'yyyy-MM-dd HH-mm-ss' in UTC, or 'now')
        #[arg(long, value_parser = parse_time)]
        before: DateTime<Utc>,
    },

    /// Thin out history with a retention policy
    Retain {
        /// Retention band as 'interval:duration', most recent first; -1 means unbounded
        #[arg(long = "band", required = true, allow_hyphen_values = true)]
        bands: Vec<RetentionBand>,
    },

    /// Restore the newest state created before a point in time
    #[command(alias = "rs")]
    Restore {
        /// Threshold (defaults to now)
        #[arg(long, value_parser = parse_time)]
        before: Option<DateTime<Utc>>,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Restore into a directory instead of a zip archive
        #[arg(long)]
        dir: bool,

        /// Directory name to nest zip entries under
        #[arg(long)]
        prefix: Option<String>,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// List restore points
    #[command(alias = "ls")]
    List,

    /// Show free space in the storage directory
    Space,
}

fn parse_time(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    if text.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }
    parse_time_arg(text).map_err(|e| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    // Run command
    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<BackupError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        source,
        storage,
        ignore,
        ignore_file,
        command,
        ..
    } = cli;

    let open = || open_backup(source, storage, ignore, ignore_file.as_deref());
    match command {
        Commands::Run { config, progress } => cmd_run(&config, progress),
        Commands::Backup { progress } => cmd_backup(&open()?, progress),
        Commands::Merge { before } => cmd_merge(&open()?, before),
        Commands::Retain { bands } => cmd_retain(&open()?, bands),
        Commands::Restore {
            before,
            out,
            dir,
            prefix,
            progress,
        } => cmd_restore(&open()?, before.unwrap_or_else(Utc::now), out, dir, prefix, progress),
        Commands::List => cmd_list(&open()?),
        Commands::Space => cmd_space(&open()?),
    }
}

/// Build the backup from the global options
///
/// A storage directory inside the source is ignored automatically.
fn open_backup(
    source: Option<PathBuf>,
    storage: Option<PathBuf>,
    mut ignore: Vec<String>,
    ignore_file: Option<&Path>,
) -> anyhow::Result<IncrementalBackup> {
    let source = source.unwrap_or_else(|| PathBuf::from("."));
    let storage = storage.unwrap_or_else(|| PathBuf::from("backups"));

    if let Some(file) = ignore_file {
        ignore.extend(backline::ignore::load_ignore_file(file)?);
    }
    if let Some(inner) = nested_storage(&source, &storage) {
        ignore.push(inner);
    }

    Ok(IncrementalBackupBuilder::new()
        .ignore_paths(ignore)
        .build(source, storage))
}

/// The storage directory as an ignore entry, when it lies inside the source
fn nested_storage(source: &Path, storage: &Path) -> Option<String> {
    let source = std::path::absolute(source).ok()?;
    let storage = std::path::absolute(storage).ok()?;
    let relative = storage.strip_prefix(&source).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(format!("{}/", segments.join("/")))
}

fn spinner(show: bool, message: &str) -> Option<ProgressBar> {
    if !show {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// Run every configured target
fn cmd_run(config_path: &Path, show_progress: bool) -> anyhow::Result<()> {
    let config = BackupConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration {:?}", config_path))?;
    let runner = BackupRunner::new(config);

    println!(
        "{}",
        format!("Backing up {} targets...", runner.config().targets.len()).blue().bold()
    );
    let progress = spinner(show_progress, "Running backups...");
    let report = runner.run()?;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    if report.skipped_low_space {
        println!("{}", "Not enough free space in the storage root; backups skipped.".yellow());
        bail!("backup run skipped for lack of free space");
    }

    for target in &report.targets {
        match &target.outcome {
            TargetOutcome::Completed(summary) => {
                println!(
                    "{} {} {} added, {} modified, {} removed ({})",
                    "✓".green().bold(),
                    target.name.yellow().bold(),
                    summary.added,
                    summary.modified,
                    summary.removed,
                    format_duration(truncate_millis(target.elapsed))
                );
            }
            TargetOutcome::Failed(message) => {
                println!("{} {} {}", "✗".red().bold(), target.name.yellow().bold(), message.red());
            }
            TargetOutcome::Cancelled => {
                println!("{} {} cancelled", "-".dimmed(), target.name.yellow().bold());
            }
        }
        if let Some(merge_error) = &target.merge_error {
            println!("    {} {}", "Merge failed:".yellow(), merge_error);
        }
    }
    println!("  Time: {}", format_duration(truncate_millis(report.elapsed)).to_string().cyan());

    let failed = report.failures().count();
    if failed > 0 {
        bail!("{} of {} targets failed", failed, report.targets.len());
    }
    Ok(())
}

/// Take one backup
fn cmd_backup(backup: &IncrementalBackup, show_progress: bool) -> anyhow::Result<()> {
    println!("{}", "Backing up...".blue().bold());

    let start = Instant::now();
    let progress = spinner(show_progress, "Scanning files...");
    let summary = backup.backup();
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let summary = summary?;

    match &summary.part {
        Some(part) => println!("{} Created part {}", "✓".green().bold(), part.yellow().bold()),
        None => println!("{} No changes since the last backup", "✓".green().bold()),
    }
    println!("  Added: {}", summary.added.to_string().green());
    println!("  Modified: {}", summary.modified.to_string().yellow());
    println!("  Removed: {}", summary.removed.to_string().red());
    println!("  Time: {}", format_duration(truncate_millis(start.elapsed())).to_string().cyan());
    warn_corrupted(&summary.corrupted_removed);
    Ok(())
}

/// Merge parts older than a threshold
fn cmd_merge(backup: &IncrementalBackup, before: DateTime<Utc>) -> anyhow::Result<()> {
    let summary = backup.merge_before(before)?;
    match &summary.target {
        Some(target) => println!(
            "{} Merged {} parts into {}",
            "✓".green().bold(),
            summary.merged.len(),
            target.yellow().bold()
        ),
        None => println!("{}", "Nothing to merge.".yellow()),
    }
    for name in &summary.failed_deletes {
        println!("  {} could not delete merged part {}", "Warning:".yellow(), name);
    }
    warn_corrupted(&summary.corrupted_removed);
    Ok(())
}

/// Apply a retention policy
fn cmd_retain(backup: &IncrementalBackup, bands: Vec<RetentionBand>) -> anyhow::Result<()> {
    let policy = RetentionPolicy::new(bands)?;
    println!("{} {}", "Applying retention:".blue().bold(), policy);

    let summary = backup.merge_by_policy(&policy, Utc::now())?;
    println!(
        "{} Merged {} parts, {} remain",
        "✓".green().bold(),
        summary.parts_merged(),
        summary.parts_remaining
    );
    Ok(())
}

/// Restore a point in time
fn cmd_restore(
    backup: &IncrementalBackup,
    before: DateTime<Utc>,
    out: PathBuf,
    into_dir: bool,
    prefix: Option<String>,
    show_progress: bool,
) -> anyhow::Result<()> {
    let sinks: Box<dyn RestoreSinkFactory> = if into_dir {
        Box::new(DirectoryRestoreSinkFactory::new(&out))
    } else {
        Box::new(ZipRestoreSinkFactory::new(&out, prefix))
    };

    let start = Instant::now();
    let progress = spinner(show_progress, "Restoring...");
    let summary = backup.restore(before, sinks.as_ref());
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let summary = summary?;

    let restore_time = summary.restore_time.map(format_part_time).unwrap_or_default();
    println!("{} Restored state of {}", "✓".green().bold(), restore_time.yellow().bold());
    println!("  Entries: {}", summary.entries_restored.to_string().cyan());
    println!("  Parts read: {}", summary.parts_read.to_string().cyan());
    println!("  Output: {}", out.display().to_string().cyan());
    println!("  Time: {}", format_duration(truncate_millis(start.elapsed())).to_string().cyan());
    warn_corrupted(&summary.corrupted_removed);
    Ok(())
}

/// List restore points
fn cmd_list(backup: &IncrementalBackup) -> anyhow::Result<()> {
    let thresholds = backup.restore_thresholds()?;
    if thresholds.is_empty() {
        println!("{}", "No backups found.".yellow());
        return Ok(());
    }

    println!("{}", "Restore points:".blue().bold());
    println!();
    let mut total = 0;
    for time in &thresholds {
        let size = ZipBackupPart::open(backup.storage_root(), *time).size_on_disk();
        total += size;
        println!("  {} {}", format_part_time(*time).yellow(), format_bytes(size).dimmed());
    }
    println!();
    println!("  {} parts, {}", thresholds.len(), format_bytes(total).cyan());
    Ok(())
}

/// Show free space in the storage root
fn cmd_space(backup: &IncrementalBackup) -> anyhow::Result<()> {
    let free = backup.free_usable_space();
    if free < 0 {
        println!("{}", "Free space is unknown for this storage directory.".yellow());
    } else {
        println!("  Free: {}", format_bytes(free as u64).cyan());
    }
    Ok(())
}

fn warn_corrupted(parts: &[String]) {
    for name in parts {
        println!("  {} removed corrupted part {}", "Warning:".yellow(), name);
    }
}

fn truncate_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
