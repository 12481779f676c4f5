//! Tiered retention policy
//!
//! A [`RetentionPolicy`] is a list of bands, most recent history first. Each
//! band covers `duration` worth of history directly before the previous band
//! and keeps at most one part per `interval` inside it:
//!
//! ```text
//!   older ◀──────────────────────────────────────────────── now
//!   │ merged │   band 1 (1 per day)   │   band 0 (1 per hour)  │
//!            ▲ horizon                 ▲ now - 1 day
//! ```
//!
//! A band without a duration reaches back to the beginning of history; a
//! band without an interval keeps every part. Everything older than the last
//! band's boundary (the horizon) collapses into one part.
//!
//! Inside the bands, parts are walked oldest to newest. A part is kept when
//! it is the oldest or newest part, when it is the first part of a newer band,
//! when its band keeps everything, or when at least `interval` has passed
//! since the last kept part. Each run of dropped parts is merged together
//! with the kept part that ends it into one [`MergeGroup`], dated one second
//! before that kept part. When a member already sits on that second, the
//! group ends at the newest member that leaves its target name free, and the
//! later parts of the run stay as they are.
//!
//! Band durations are written as `interval:duration` on the command line and
//! as `{"interval": secs, "duration": secs}` in configuration, with `-1`
//! standing for "keep all" and "forever" respectively.

use crate::error::{BackupError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

/// One `(interval, duration)` band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBand", into = "RawBand")]
pub struct RetentionBand {
    /// Minimum spacing between kept parts, `None` to keep every part
    pub interval: Option<Duration>,
    /// History covered by this band, `None` for all remaining history
    pub duration: Option<Duration>,
}

#[derive(Serialize, Deserialize)]
struct RawBand {
    interval: i64,
    duration: i64,
}

fn secs_or_unbounded(value: i64, what: &str) -> Result<Option<Duration>> {
    match value {
        -1 => Ok(None),
        v if v >= 0 => Ok(Some(Duration::from_secs(v as u64))),
        v => Err(BackupError::InvalidPolicy(format!("{} must be -1 or at least 0, got {}", what, v))),
    }
}

impl RetentionBand {
    /// Create a band
    pub fn new(interval: Option<Duration>, duration: Option<Duration>) -> Self {
        Self { interval, duration }
    }

    /// Create a band from seconds, `-1` meaning unbounded
    pub fn from_secs(interval: i64, duration: i64) -> Result<Self> {
        Ok(Self {
            interval: secs_or_unbounded(interval, "interval")?,
            duration: secs_or_unbounded(duration, "duration")?,
        })
    }
}

impl TryFrom<RawBand> for RetentionBand {
    type Error = BackupError;

    fn try_from(raw: RawBand) -> Result<Self> {
        Self::from_secs(raw.interval, raw.duration)
    }
}

impl From<RetentionBand> for RawBand {
    fn from(band: RetentionBand) -> Self {
        let secs = |d: Option<Duration>| d.map_or(-1, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        RawBand {
            interval: secs(band.interval),
            duration: secs(band.duration),
        }
    }
}

fn parse_bound(text: &str, what: &str) -> Result<Option<Duration>> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<i64>() {
        return secs_or_unbounded(secs, what);
    }
    humantime::parse_duration(text)
        .map(Some)
        .map_err(|e| BackupError::InvalidPolicy(format!("invalid {} '{}': {}", what, text, e)))
}

impl FromStr for RetentionBand {
    type Err = BackupError;

    /// Parse `interval:duration`, each side in seconds, `-1`, or a
    /// humantime duration such as `1h` or `7days`
    fn from_str(s: &str) -> Result<Self> {
        let (interval, duration) = s.split_once(':').ok_or_else(|| {
            BackupError::InvalidPolicy(format!("expected 'interval:duration', got '{}'", s))
        })?;
        Ok(Self {
            interval: parse_bound(interval, "interval")?,
            duration: parse_bound(duration, "duration")?,
        })
    }
}

impl fmt::Display for RetentionBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interval {
            Some(interval) => write!(f, "one per {}", humantime::format_duration(interval))?,
            None => f.write_str("all")?,
        }
        match self.duration {
            Some(duration) => write!(f, " for {}", humantime::format_duration(duration)),
            None => f.write_str(" forever"),
        }
    }
}

/// A run of parts to collapse into one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeGroup {
    /// Indices into the oldest-first part list
    pub range: Range<usize>,
    /// Creation time of the merged part
    pub target: DateTime<Utc>,
}

/// Ordered retention bands, most recent history first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RetentionBand>", into = "Vec<RetentionBand>")]
pub struct RetentionPolicy {
    bands: Vec<RetentionBand>,
}

fn to_delta(duration: Duration) -> TimeDelta {
    i64::try_from(duration.as_secs())
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

fn step_back(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    time.checked_sub_signed(to_delta(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl RetentionPolicy {
    /// Validate and wrap `bands`
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidPolicy`] if there are no bands, a duration is
    ///   zero, or a band follows one that already reaches back forever
    pub fn new(bands: Vec<RetentionBand>) -> Result<Self> {
        if bands.is_empty() {
            return Err(BackupError::InvalidPolicy("at least one band is required".to_string()));
        }
        for (index, band) in bands.iter().enumerate() {
            if band.duration == Some(Duration::ZERO) {
                return Err(BackupError::InvalidPolicy(format!("band {} has a zero duration", index)));
            }
            if band.duration.is_none() && index + 1 < bands.len() {
                return Err(BackupError::InvalidPolicy(format!(
                    "band {} covers all remaining history; later bands are unreachable",
                    index
                )));
            }
        }
        Ok(Self { bands })
    }

    /// The bands, most recent first
    pub fn bands(&self) -> &[RetentionBand] {
        &self.bands
    }

    /// Time before which everything collapses into one part
    ///
    /// `None` when the last band reaches back forever.
    pub fn horizon(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut time = now;
        for band in &self.bands {
            time = step_back(time, band.duration?);
        }
        Some(time)
    }

    /// Start of each band with a finite duration, most recent first
    fn boundaries(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut time = now;
        self.bands
            .iter()
            .map_while(|band| {
                time = step_back(time, band.duration?);
                Some(time)
            })
            .collect()
    }

    fn band_of(&self, boundaries: &[DateTime<Utc>], time: DateTime<Utc>) -> usize {
        boundaries
            .iter()
            .position(|start| time >= *start)
            .unwrap_or_else(|| boundaries.len().min(self.bands.len() - 1))
    }

    /// Plan the merges inside the bands
    ///
    /// `times` are part creation times, oldest first. Parts older than the
    /// horizon are treated as belonging to the oldest band; callers merge
    /// them away beforehand.
    pub fn plan(&self, times: &[DateTime<Utc>], now: DateTime<Utc>) -> Vec<MergeGroup> {
        let mut groups = Vec::new();
        if times.len() < 3 {
            return groups;
        }

        let boundaries = self.boundaries(now);
        let last = times.len() - 1;
        let mut band = self.band_of(&boundaries, times[0]);
        let mut last_kept = 0;

        for (index, &time) in times.iter().enumerate().skip(1) {
            let current = self.band_of(&boundaries, time);
            let crossed = current < band;
            if crossed {
                band = current;
            }

            let keep = crossed
                || index == last
                || match self.bands[band].interval {
                    None => true,
                    Some(interval) => time - times[last_kept] >= to_delta(interval),
                };
            if !keep {
                continue;
            }

            // dropped parts fold into the accepted part that ends their run;
            // the target must not reuse the name of a member
            let mut end = index;
            while end > last_kept + 1 && times[end - 1] >= times[end] - TimeDelta::seconds(1) {
                end -= 1;
            }
            if end > last_kept + 1 {
                groups.push(MergeGroup {
                    range: last_kept + 1..end + 1,
                    target: times[end] - TimeDelta::seconds(1),
                });
            }
            last_kept = index;
        }

        groups
    }
}

impl TryFrom<Vec<RetentionBand>> for RetentionPolicy {
    type Error = BackupError;

    fn try_from(bands: Vec<RetentionBand>) -> Result<Self> {
        Self::new(bands)
    }
}

impl From<RetentionPolicy> for Vec<RetentionBand> {
    fn from(policy: RetentionPolicy) -> Self {
        policy.bands
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, band) in self.bands.iter().enumerate() {
            if index > 0 {
                f.write_str(", then ")?;
            }
            write!(f, "{}", band)?;
        }
        Ok(())
    }
}
