//! Chaos tests for backline
//!
//! Damages stored parts at random and interrupts running operations, then
//! checks that history stays usable: damaged parts are dropped as a unit and
//! the next backup brings the storage back in line with the source.

use ::backline::*;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::integration::{snapshot, BackupTestHarness};

/// Ways of damaging a part on disk
#[derive(Debug, Clone, Copy)]
pub enum Damage {
    /// Drop the trailing marker line of the change log
    TruncateLog,
    /// Delete the change log
    DeleteLog,
    /// Replace a prefix character with garbage
    ScrambleLog,
    /// Remove the digest line of the first file addition
    DropDigest,
}

impl Damage {
    const ALL: [Damage; 4] = [
        Damage::TruncateLog,
        Damage::DeleteLog,
        Damage::ScrambleLog,
        Damage::DropDigest,
    ];

    pub fn apply(self, meta: &Path) {
        match self {
            Damage::DeleteLog => fs::remove_file(meta).unwrap(),
            Damage::TruncateLog => {
                let text = fs::read_to_string(meta).unwrap();
                let kept: String = text
                    .lines()
                    .filter(|l| !l.starts_with('#'))
                    .map(|l| format!("{}\n", l))
                    .collect();
                fs::write(meta, kept).unwrap();
            }
            Damage::ScrambleLog => {
                let text = fs::read_to_string(meta).unwrap();
                fs::write(meta, format!("?{}", &text[1..])).unwrap();
            }
            Damage::DropDigest => {
                let text = fs::read_to_string(meta).unwrap();
                let mut dropped = false;
                let kept: String = text
                    .lines()
                    .filter(|l| {
                        if !dropped && l.starts_with('\t') {
                            dropped = true;
                            return false;
                        }
                        true
                    })
                    .map(|l| format!("{}\n", l))
                    .collect();
                if dropped {
                    fs::write(meta, kept).unwrap();
                } else {
                    // no file additions to strip
                    Damage::TruncateLog.apply(meta);
                }
            }
        }
    }
}

/// Chaos driver over a [`BackupTestHarness`]
pub struct ChaosEngine {
    pub rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Damage one random part, returning its name
    pub fn damage_random_part(&mut self, storage: &Path) -> Option<(String, Damage)> {
        let times = ZipPartFactory::new(storage).part_times().unwrap();
        if times.is_empty() {
            return None;
        }
        let time = times[self.rng.random_range(0..times.len())];
        let damage = Damage::ALL[self.rng.random_range(0..Damage::ALL.len())];
        let name = utils::format_part_time(time);
        damage.apply(&meta_path(storage, time));
        warn!("Damaged part {} with {:?}", name, damage);
        Some((name, damage))
    }
}

pub fn meta_path(storage: &Path, time: DateTime<Utc>) -> PathBuf {
    storage.join(format!("{}.meta", utils::format_part_time(time)))
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_recovers_from_random_damage() {
        let mut chaos = ChaosEngine::new(7);
        for round in 0..8 {
            let mut harness = BackupTestHarness::new();
            harness.generator = crate::integration::FileGenerator::new(round);
            for step in 0..5 {
                harness.mutate(6);
                harness.backup_at(at(step * 60));
            }

            let (damaged, damage) = chaos.damage_random_part(&harness.storage()).unwrap();
            info!("Round {}: damaged {} with {:?}", round, damaged, damage);

            let summary = harness.backup.backup_at(at(600)).unwrap();
            assert_eq!(summary.corrupted_removed, vec![damaged.clone()]);
            assert!(!harness.storage().join(format!("{}.zip", damaged)).exists());

            // the fresh part fills in whatever the lost part carried
            let expected = snapshot(&harness.source());
            let (_, restored) = harness.restore_before(at(601));
            assert_eq!(restored, expected, "round {} with {:?}", round, damage);
        }
    }

    #[test]
    fn test_restore_reports_damaged_archive() {
        let mut harness = BackupTestHarness::new();
        harness.write("a", "a");
        harness.backup_at(at(0));
        let archive = harness
            .storage()
            .join(format!("{}.zip", utils::format_part_time(at(0))));
        fs::write(&archive, b"PK\x03\x04 not really").unwrap();

        let out = harness.dir.path().join("out");
        let err = harness
            .backup
            .restore(at(1), &DirectoryRestoreSinkFactory::new(&out))
            .unwrap_err();
        assert!(err.is_corruption());
        assert!(!out.join(utils::format_part_time(at(0))).exists());
    }

    #[test]
    fn test_every_part_damaged() {
        let mut harness = BackupTestHarness::new();
        harness.write("a", "a");
        harness.backup_at(at(0));
        harness.write("b", "b");
        harness.backup_at(at(60));
        for time in [at(0), at(60)] {
            Damage::DeleteLog.apply(&meta_path(&harness.storage(), time));
        }

        let out = harness.dir.path().join("out");
        let err = harness
            .backup
            .restore(at(120), &DirectoryRestoreSinkFactory::new(&out))
            .unwrap_err();
        assert!(matches!(err.root(), BackupError::NoBackupBefore(_)));

        // a full backup starts history over
        let summary = harness.backup.backup_at(at(180)).unwrap();
        assert_eq!(summary.added, 2);
        assert!(summary.corrupted_removed.is_empty());
    }

    #[test]
    fn test_cancellation_mid_backup_leaves_no_part() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        for d in 0..20 {
            let sub = source.join(format!("dir_{}", d));
            fs::create_dir_all(&sub).unwrap();
            for f in 0..50 {
                fs::write(sub.join(format!("file_{}", f)), vec![d as u8; 4096]).unwrap();
            }
        }

        let cancel = CancelFlag::new();
        let backup = IncrementalBackupBuilder::new()
            .cancel_flag(cancel.clone())
            .build(&source, dir.path().join("storage"));

        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                cancel.cancel();
            })
        };
        let result = backup.backup_at(at(0));
        canceller.join().unwrap();

        match result {
            Ok(summary) => {
                // finished before the flag was raised
                assert_eq!(summary.added, 20 + 20 * 50);
            }
            Err(e) => {
                assert!(e.is_cancelled());
                assert!(backup.restore_thresholds().unwrap().is_empty());
                assert!(!dir
                    .path()
                    .join("storage")
                    .join(format!("{}.zip", utils::format_part_time(at(0))))
                    .exists());
            }
        }

        // a reset flag lets the next run complete
        cancel.reset();
        let summary = backup.backup_at(at(60)).unwrap();
        assert!(summary.total_changes() > 0 || backup.restore_thresholds().unwrap().len() == 1);
    }

    #[test]
    fn test_cancelled_merge_keeps_sources() {
        let mut harness = BackupTestHarness::new();
        for step in 0..4 {
            harness.write(&format!("f{}", step), "x");
            harness.backup_at(at(step * 60));
        }
        harness.backup.cancel_flag().cancel();
        let err = harness.backup.merge_before(at(1000)).unwrap_err();
        assert!(err.is_cancelled());

        harness.backup.cancel_flag().reset();
        assert_eq!(harness.backup.restore_thresholds().unwrap().len(), 4);
    }
}
