//! Integration tests for backline
//!
//! Drives full backup histories through the public API and checks that every
//! restore point reproduces the directory exactly as it was.

use ::backline::*;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Directory contents: relative path to file bytes, `None` for directories
pub type Snapshot = BTreeMap<String, Option<Vec<u8>>>;

/// Capture `root` the way a restore would reproduce it
pub fn snapshot(root: &Path) -> Snapshot {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.unwrap();
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            files.insert(format!("{}/", relative), None);
        } else {
            files.insert(relative, Some(fs::read(entry.path()).unwrap()));
        }
    }
    files
}

/// Source directory, storage root and restore area for one history
pub struct BackupTestHarness {
    pub dir: TempDir,
    pub backup: IncrementalBackup,
    pub generator: FileGenerator,
    /// Source snapshot taken at every backup
    pub history: Vec<(DateTime<Utc>, Snapshot)>,
    restores: usize,
}

impl BackupTestHarness {
    pub fn new() -> Self {
        Self::with_ignore(Vec::<String>::new())
    }

    pub fn with_ignore<I, S>(ignore: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("source")).unwrap();
        let backup = IncrementalBackupBuilder::new()
            .ignore_paths(ignore)
            .build(dir.path().join("source"), dir.path().join("storage"));
        Self {
            dir,
            backup,
            generator: FileGenerator::new(42),
            history: Vec::new(),
            restores: 0,
        }
    }

    pub fn source(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub fn storage(&self) -> PathBuf {
        self.dir.path().join("storage")
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.source().join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    /// Back up at `time` and remember what the source looked like
    pub fn backup_at(&mut self, time: DateTime<Utc>) -> BackupSummary {
        let summary = self.backup.backup_at(time).unwrap();
        self.history.push((time, snapshot(&self.source())));
        summary
    }

    /// Restore into a fresh directory and capture it
    pub fn restore_before(&mut self, before: DateTime<Utc>) -> (RestoreSummary, Snapshot) {
        self.restores += 1;
        let out = self.dir.path().join(format!("restore-{}", self.restores));
        let summary = self
            .backup
            .restore(before, &DirectoryRestoreSinkFactory::new(&out))
            .unwrap();
        let root = out.join(utils::format_part_time(summary.restore_time.unwrap()));
        (summary, snapshot(&root))
    }

    /// Apply random mutations to the source
    pub fn mutate(&mut self, count: usize) {
        let root = self.source();
        for _ in 0..count {
            let existing: Vec<PathBuf> = walkdir::WalkDir::new(&root)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().to_path_buf())
                .collect();

            match self.generator.rng.random_range(0..4) {
                0 | 1 if !existing.is_empty() => {
                    let index = self.generator.rng.random_range(0..existing.len());
                    if self.generator.rng.random_bool(0.5) {
                        fs::write(&existing[index], self.generator.content()).unwrap();
                    } else {
                        fs::remove_file(&existing[index]).unwrap();
                    }
                }
                2 => {
                    let dir = root.join(self.generator.name("dir"));
                    fs::create_dir_all(&dir).unwrap();
                }
                _ => {
                    let path = if self.generator.rng.random_bool(0.5) {
                        root.join(self.generator.name("file"))
                    } else {
                        root.join(self.generator.name("dir")).join(self.generator.name("file"))
                    };
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(path, self.generator.content()).unwrap();
                }
            }
        }
    }
}

impl Default for BackupTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic file names and contents
pub struct FileGenerator {
    pub rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A name from a small pool so paths are reused across mutations
    pub fn name(&mut self, stem: &str) -> String {
        format!("{}_{}", stem, self.rng.random_range(0..6))
    }

    pub fn content(&mut self) -> Vec<u8> {
        let len = self.rng.random_range(0..2048);
        (0..len).map(|_| self.rng.random()).collect()
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn hours(h: i64) -> DateTime<Utc> {
    base_time() + TimeDelta::hours(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_exactness() {
        let mut harness = BackupTestHarness::new();
        harness.write("file1", "one");
        harness.write("dir1/f", "f");

        harness.backup_at(hours(0));
        fs::remove_file(harness.source().join("file1")).unwrap();
        harness.backup_at(hours(1));

        let (_, latest) = harness.restore_before(Utc::now());
        assert_eq!(latest.keys().collect::<Vec<_>>(), vec!["dir1/", "dir1/f"]);

        let (summary, first) = harness.restore_before(hours(0) + TimeDelta::seconds(1));
        assert_eq!(summary.restore_time, Some(hours(0)));
        assert_eq!(first.keys().collect::<Vec<_>>(), vec!["dir1/", "dir1/f", "file1"]);
    }

    #[test]
    fn test_every_restore_point_matches_history() {
        let mut harness = BackupTestHarness::new();
        for round in 0..12 {
            harness.mutate(8);
            harness.backup_at(hours(round));
        }
        info!("Recorded {} backups", harness.history.len());

        let history = harness.history.clone();
        for (time, expected) in history {
            if !harness.backup.restore_thresholds().unwrap().contains(&time) {
                // no changes that round, so no part
                continue;
            }
            let (summary, restored) = harness.restore_before(time + TimeDelta::seconds(1));
            assert_eq!(summary.restore_time, Some(time));
            assert_eq!(restored, expected, "restore at {} differs", time);
        }
    }

    #[test]
    fn test_merge_preserves_latest_state() {
        let mut harness = BackupTestHarness::new();
        for round in 0..10 {
            harness.mutate(6);
            harness.backup_at(hours(round));
        }
        let expected = harness.history.last().unwrap().1.clone();

        let summary = harness.backup.merge_before(hours(8)).unwrap();
        assert!(summary.target.is_some());
        let thresholds = harness.backup.restore_thresholds().unwrap();
        assert!(thresholds.iter().filter(|t| **t < hours(8)).count() <= 1);

        let (_, restored) = harness.restore_before(Utc::now());
        assert_eq!(restored, expected);

        // the merged part is a full restore point of its own
        let merged_at = thresholds[0];
        let (_, restored) = harness.restore_before(merged_at + TimeDelta::seconds(1));
        let before_cut = harness
            .history
            .iter()
            .rev()
            .find(|(time, _)| *time < hours(8))
            .map(|(_, snap)| snap.clone())
            .unwrap();
        assert_eq!(restored, before_cut);
    }

    #[test]
    fn test_backup_after_merge_is_incremental() {
        let mut harness = BackupTestHarness::new();
        harness.write("a", "a");
        harness.backup_at(hours(0));
        harness.write("b", "b");
        harness.backup_at(hours(1));
        harness.backup.merge_before(hours(2)).unwrap();

        harness.write("c", "c");
        let summary = harness.backup_at(hours(3));
        assert_eq!((summary.added, summary.modified, summary.removed), (1, 0, 0));
    }

    #[test]
    fn test_retention_collapses_older_day() {
        let mut harness = BackupTestHarness::new();
        for h in 0..48 {
            harness.write(&format!("hour_{:02}", h), "x");
            harness.backup_at(hours(h));
        }
        let now = hours(47) + TimeDelta::minutes(30);
        let policy = RetentionPolicy::new(vec![
            RetentionBand::from_secs(3600, 86_400).unwrap(),
            RetentionBand::from_secs(86_400, -1).unwrap(),
        ])
        .unwrap();

        let summary = harness.backup.merge_by_policy(&policy, now).unwrap();
        // the older day folds into the first part of the newer one
        assert_eq!(summary.parts_remaining, 25);
        assert_eq!(summary.parts_merged(), 24);

        let thresholds = harness.backup.restore_thresholds().unwrap();
        assert_eq!(thresholds.first(), Some(&hours(0)));
        assert_eq!(thresholds.last(), Some(&hours(47)));
        assert!(thresholds.contains(&(hours(24) - TimeDelta::seconds(1))));
        assert_eq!(thresholds.iter().filter(|t| **t >= hours(24)).count(), 23);

        let expected = harness.history.last().unwrap().1.clone();
        let (_, restored) = harness.restore_before(Utc::now());
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_retention_thins_parts_denser_than_band() {
        let mut harness = BackupTestHarness::new();
        let half_hour = |i: i64| hours(0) + TimeDelta::minutes(30 * i);
        for i in 0..49 {
            harness.mutate(3);
            harness.write(&format!("step_{:02}", i), &i.to_string());
            harness.backup_at(half_hour(i));
        }
        let policy = RetentionPolicy::new(vec![RetentionBand::from_secs(3600, -1).unwrap()]).unwrap();

        let summary = harness.backup.merge_by_policy(&policy, half_hour(48)).unwrap();
        assert_eq!(summary.band_merges.len(), 24);
        assert_eq!(summary.parts_merged(), 48);
        assert_eq!(summary.parts_remaining, 25);

        // each merged part carries the state of the hourly backup it absorbed
        let thresholds = harness.backup.restore_thresholds().unwrap();
        assert_eq!(thresholds.len(), 25);
        for threshold in thresholds {
            let state_time = if threshold == hours(0) {
                threshold
            } else {
                threshold + TimeDelta::seconds(1)
            };
            let expected = harness
                .history
                .iter()
                .find(|(time, _)| *time == state_time)
                .map(|(_, snapshot)| snapshot.clone())
                .unwrap();
            let (summary, restored) = harness.restore_before(threshold + TimeDelta::seconds(1));
            assert_eq!(summary.restore_time, Some(threshold));
            assert_eq!(restored, expected, "restore point {}", threshold);
        }
    }

    #[test]
    fn test_keep_all_band_preserves_every_part() {
        let mut harness = BackupTestHarness::new();
        for h in 0..48 {
            harness.write(&format!("hour_{:02}", h), "x");
            harness.backup_at(hours(h));
        }
        let policy = RetentionPolicy::new(vec![
            RetentionBand::from_secs(3600, 86_400).unwrap(),
            RetentionBand::from_secs(-1, -1).unwrap(),
        ])
        .unwrap();

        let summary = harness
            .backup
            .merge_by_policy(&policy, hours(47) + TimeDelta::minutes(30))
            .unwrap();
        assert_eq!(summary.parts_merged(), 0);
        assert_eq!(summary.parts_remaining, 48);
    }

    #[test]
    fn test_bounded_policy_merges_past_horizon() {
        let mut harness = BackupTestHarness::new();
        for h in 0..30 {
            harness.write(&format!("hour_{:02}", h), "x");
            harness.backup_at(hours(h));
        }
        // keep one day of hourly parts, merge everything older into one
        let policy = RetentionPolicy::new(vec![RetentionBand::from_secs(3600, 86_400).unwrap()]).unwrap();
        let summary = harness
            .backup
            .merge_by_policy(&policy, hours(29) + TimeDelta::minutes(30))
            .unwrap();

        let horizon = summary.horizon_merge.unwrap();
        assert_eq!(horizon.merged.len(), 6);
        assert_eq!(summary.parts_remaining, 25);
    }

    #[test]
    fn test_ignored_subtree_never_recorded() {
        let mut harness = BackupTestHarness::with_ignore(["cache/", "session.lock"]);
        harness.write("cache/blob", "blob");
        harness.write("session.lock", "lock");
        harness.write("level.dat", "level");
        let summary = harness.backup_at(hours(0));
        assert_eq!(summary.added, 1);

        // ignoring later hides paths already in history from restores
        harness.backup.set_ignore_paths(["level.dat".to_string()].into_iter().collect());
        let (summary, restored) = harness.restore_before(hours(1));
        assert_eq!(summary.entries_restored, 0);
        assert!(restored.is_empty());
    }

    #[test]
    fn test_zip_restore_with_prefix() {
        let mut harness = BackupTestHarness::new();
        harness.write("region/r.0.0.mca", "chunk");
        harness.backup_at(hours(0));

        let out = harness.dir.path().join("zips");
        let sinks = ZipRestoreSinkFactory::new(&out, Some("world".to_string()));
        harness.backup.restore(hours(1), &sinks).unwrap();

        let archive = out.join(format!("{}.zip", utils::format_part_time(hours(0))));
        let zip = zip::ZipArchive::new(fs::File::open(archive).unwrap()).unwrap();
        let mut names: Vec<&str> = zip.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["world/region/", "world/region/r.0.0.mca"]);
    }

    #[test]
    fn test_runner_with_configuration_file() {
        let dir = TempDir::new().unwrap();
        for name in ["alpha", "beta"] {
            fs::create_dir_all(dir.path().join(name).join("logs")).unwrap();
            fs::write(dir.path().join(name).join("data.txt"), name).unwrap();
            fs::write(dir.path().join(name).join("logs/latest.log"), "log").unwrap();
        }
        let config_path = dir.path().join("backline.json");
        fs::write(
            &config_path,
            r#"{
                "storage_root": "store",
                "min_free_space_mb": 0,
                "targets": [
                    {"source": "alpha", "ignore": ["logs/"]},
                    {"source": "beta", "name": "second"}
                ]
            }"#,
        )
        .unwrap();

        let config = BackupConfig::load(&config_path).unwrap();
        let report = BackupRunner::new(config).run().unwrap();
        assert!(report.all_succeeded());

        let added: Vec<usize> = report
            .targets
            .iter()
            .map(|t| match &t.outcome {
                TargetOutcome::Completed(summary) => summary.added,
                other => panic!("unexpected outcome {:?}", other),
            })
            .collect();
        assert_eq!(added, vec![1, 3]);
        assert!(dir.path().join("store/second").is_dir());
    }
}
