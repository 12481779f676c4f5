//! Property-based testing for backline
//!
//! Uses proptest to check the ignore matcher, the change-log format and the
//! retention planner against randomly generated inputs.

use ::backline::*;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Path segments without separators
fn segment_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|s| s),
        "dir[0-9]{1,2}".prop_map(|s| s),
        "[a-z]{1,5}\\.(txt|dat|mca)".prop_map(|s| s),
    ]
}

fn segments_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(segment_strategy(), 1..5)
}

/// A change log with a mix of file, directory and removal entries
fn change_log_strategy() -> impl Strategy<Value = ChangeLog> {
    prop::collection::vec(
        (segments_strategy(), 0..3u8, prop::array::uniform32(any::<u8>())),
        0..30,
    )
    .prop_map(|entries| {
        let mut log = BTreeMap::new();
        for (segments, kind, digest) in entries {
            let (path, change) = match kind {
                0 => (
                    RelPath::from_segments(&segments, false),
                    Change::Addition(Some(ContentDigest::from_bytes(digest))),
                ),
                1 => (RelPath::from_segments(&segments, true), Change::Addition(None)),
                _ => (RelPath::from_segments(&segments, false), Change::Removal),
            };
            log.insert(path, change);
        }
        log
    })
}

/// Strictly increasing whole-second times
fn times_strategy() -> impl Strategy<Value = Vec<DateTime<Utc>>> {
    prop::collection::vec(1..20_000i64, 0..60).prop_map(|gaps| {
        let mut time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        gaps.into_iter()
            .map(|gap| {
                time += TimeDelta::seconds(gap);
                time
            })
            .collect()
    })
}

fn band_strategy() -> impl Strategy<Value = RetentionBand> {
    (prop_oneof![Just(-1i64), 1..7_200i64], 600..100_000i64)
        .prop_map(|(interval, duration)| RetentionBand::from_secs(interval, duration).unwrap())
}

fn policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (prop::collection::vec(band_strategy(), 0..3), prop_oneof![Just(-1i64), 1..7_200i64]).prop_map(
        |(mut bands, last_interval)| {
            bands.push(RetentionBand::from_secs(last_interval, -1).unwrap());
            RetentionPolicy::new(bands).unwrap()
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_ignored_directory_covers_descendants(
        dir in segments_strategy(),
        rest in segments_strategy(),
        is_dir in any::<bool>(),
    ) {
        let ignored = RelPath::from_segments(&dir, true);
        let ignore = IgnoreSet::from_paths([ignored.as_str()]);

        let mut below = dir.clone();
        below.extend(rest);
        prop_assert!(ignore.is_ignored(&RelPath::from_segments(&below, is_dir)));
        prop_assert!(ignore.is_ignored(&ignored));
        // the same name as a file is a different path
        prop_assert!(!ignore.is_ignored(&RelPath::from_segments(&dir, false)));
    }

    #[test]
    fn prop_ignored_file_leaves_siblings(
        parent in prop::collection::vec(segment_strategy(), 0..3),
        name in segment_strategy(),
        sibling in segment_strategy(),
    ) {
        prop_assume!(name != sibling);
        let mut file = parent.clone();
        file.push(name);
        let mut other = parent.clone();
        other.push(sibling);

        let ignore = IgnoreSet::from_paths([RelPath::from_segments(&file, false).as_str()]);
        prop_assert!(ignore.is_ignored(&RelPath::from_segments(&file, false)));
        prop_assert!(!ignore.is_ignored(&RelPath::from_segments(&other, false)));
        if !parent.is_empty() {
            prop_assert!(!ignore.is_ignored(&RelPath::from_segments(&parent, true)));
        }
    }

    #[test]
    fn prop_change_log_parses_what_it_renders(log in change_log_strategy()) {
        let id = PartId::new("2024-01-01 00-00-00", "/tmp/2024-01-01 00-00-00.zip");
        let text = change_log::render(&log, &id.name);
        prop_assert_eq!(change_log::parse(&text, &id).unwrap(), log);

        // any other marker is rejected
        let other = PartId::new("2024-01-01 00-00-01", "/tmp/2024-01-01 00-00-01.zip");
        prop_assert!(change_log::parse(&text, &other).is_err());
    }

    #[test]
    fn prop_retention_groups_are_well_formed(
        times in times_strategy(),
        policy in policy_strategy(),
        lag in 0..100_000i64,
    ) {
        let now = times.last().copied().unwrap_or_else(Utc::now) + TimeDelta::seconds(lag);
        let groups = policy.plan(&times, now);

        let mut previous_end = 0;
        for group in &groups {
            // never touches the oldest part, never overlaps
            prop_assert!(group.range.start >= 1);
            prop_assert!(group.range.end <= times.len());
            prop_assert!(group.range.start >= previous_end);
            prop_assert!(group.range.len() >= 2);
            previous_end = group.range.end;

            // dated just before its newest member, on a free second
            let newest = group.range.end - 1;
            prop_assert!(group.target < times[newest]);
            prop_assert!(group.target > times[newest - 1]);
        }
    }

    #[test]
    fn prop_keep_all_policy_never_merges(times in times_strategy()) {
        let policy = RetentionPolicy::new(vec![RetentionBand::from_secs(-1, -1).unwrap()]).unwrap();
        let now = times.last().copied().unwrap_or_else(Utc::now);
        prop_assert!(policy.plan(&times, now).is_empty());
    }
}
