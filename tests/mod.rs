//! Main test module for backline
//!
//! This module includes all test suites:
//! - Integration tests for full backup histories
//! - Chaos tests for damaged storage and interrupted operations
//! - Property-based tests for invariants
//! - Edge cases around unusual source trees

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::backline::*;
    use crate::integration::{hours, snapshot, BackupTestHarness};
    use std::fs;

    #[test]
    fn test_empty_source() {
        let mut harness = BackupTestHarness::new();
        let summary = harness.backup_at(hours(0));
        assert_eq!(summary.total_changes(), 0);
        assert!(summary.part.is_none());
        assert!(harness.backup.restore_thresholds().unwrap().is_empty());
        assert!(!harness.storage().join("2024-01-01 00-00-00.zip").exists());
    }

    #[test]
    fn test_empty_directories_are_backed_up() {
        let mut harness = BackupTestHarness::new();
        fs::create_dir_all(harness.source().join("a/b/c")).unwrap();
        let summary = harness.backup_at(hours(0));
        assert_eq!(summary.added, 3);

        fs::remove_dir(harness.source().join("a/b/c")).unwrap();
        let summary = harness.backup_at(hours(1));
        assert_eq!(summary.removed, 1);

        let (_, restored) = harness.restore_before(hours(2));
        assert_eq!(restored.keys().collect::<Vec<_>>(), vec!["a/", "a/b/"]);
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let mut harness = BackupTestHarness::new();
        harness.write("thing", "file");
        harness.backup_at(hours(0));

        fs::remove_file(harness.source().join("thing")).unwrap();
        harness.write("thing/inner", "inner");
        let summary = harness.backup_at(hours(1));
        assert_eq!((summary.added, summary.removed), (2, 1));

        let (_, restored) = harness.restore_before(hours(2));
        assert_eq!(restored, snapshot(&harness.source()));
    }

    #[test]
    fn test_special_filenames() {
        let mut harness = BackupTestHarness::new();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "#starts-with-hash",
            "+starts-with-plus",
            "-starts-with-minus",
        ];
        for name in names {
            // skip names the platform refuses
            let _ = fs::write(harness.source().join(name), name);
        }
        harness.backup_at(hours(0));

        let (_, restored) = harness.restore_before(hours(1));
        assert_eq!(restored, snapshot(&harness.source()));
    }

    #[test]
    fn test_unicode_filenames() {
        let mut harness = BackupTestHarness::new();
        for name in ["файл.txt", "文件.txt", "ファイル.txt", "αρχείο.txt", "🚀🌟💾.txt"] {
            let _ = fs::write(harness.source().join(name), name);
        }
        harness.backup_at(hours(0));

        let (_, restored) = harness.restore_before(hours(1));
        assert_eq!(restored, snapshot(&harness.source()));
    }

    #[test]
    fn test_identical_rewrite_is_not_a_modification() {
        let mut harness = BackupTestHarness::new();
        harness.write("same", "content");
        harness.backup_at(hours(0));
        harness.write("same", "content");
        let summary = harness.backup_at(hours(1));
        assert_eq!(summary.total_changes(), 0);
    }

    #[test]
    fn test_symlinks_are_skipped() {
        #[cfg(unix)]
        {
            let mut harness = BackupTestHarness::new();
            harness.write("real/file", "data");
            std::os::unix::fs::symlink(harness.source().join("real"), harness.source().join("linked")).unwrap();
            std::os::unix::fs::symlink(harness.source().join("gone"), harness.source().join("dangling")).unwrap();

            let summary = harness.backup_at(hours(0));
            // real/, real/file
            assert_eq!(summary.added, 2);
        }
    }

    #[test]
    fn test_backslash_in_file_name() {
        #[cfg(unix)]
        {
            let mut harness = BackupTestHarness::new();
            harness.write("a\\b", "literal backslash");
            harness.write("keep", "one");
            let summary = harness.backup_at(hours(0));
            assert_eq!(summary.added, 2);

            harness.write("keep", "two");
            let summary = harness.backup_at(hours(1));
            assert_eq!((summary.added, summary.modified, summary.removed), (0, 1, 0));

            harness.write("keep", "three");
            let summary = harness.backup_at(hours(2));
            assert_eq!(summary.modified, 1);
            assert!(summary.corrupted_removed.is_empty());
            assert_eq!(
                harness.backup.restore_thresholds().unwrap(),
                vec![hours(0), hours(1), hours(2)]
            );

            for (time, expected) in harness.history.clone() {
                let (_, restored) = harness.restore_before(time + chrono::TimeDelta::seconds(1));
                assert_eq!(restored, expected);
                assert!(restored.contains_key("a\\b"));
            }
        }
    }

    #[test]
    fn test_restore_into_existing_directory_fails_cleanly() {
        let mut harness = BackupTestHarness::new();
        harness.write("a", "a");
        harness.backup_at(hours(0));

        let out = harness.dir.path().join("out");
        let existing = out.join(utils::format_part_time(hours(0)));
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("keep"), "keep").unwrap();

        let result = harness
            .backup
            .restore(hours(1), &DirectoryRestoreSinkFactory::new(&out));
        assert!(result.is_err());
        // someone else's directory is left alone
        assert!(existing.join("keep").exists());
    }
}
