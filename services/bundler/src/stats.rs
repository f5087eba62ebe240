//! Release statistics.
//!
//! Row processing fills a [`ClipStats`] accumulator per locale. At the end of
//! the run it is consumed into [`LocaleSummary`] values (ratios and a user
//! count), which become part of the [`ReleaseStats`] document. The document
//! is persisted by [`StatsStore`] and merged field by field across restarts,
//! newer values winning.

use crate::catalog::ClipRecord;
use crate::ledger::{read_json, write_json_atomic, ArchiveMetadata, LedgerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Demographic columns tracked per locale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemographicSplits<T> {
    #[serde(default)]
    pub accent: BTreeMap<String, T>,
    #[serde(default)]
    pub age: BTreeMap<String, T>,
    #[serde(default)]
    pub gender: BTreeMap<String, T>,
}

/// Running statistics for one locale
///
/// Missing demographics are counted under the empty-string bucket so every
/// split sums to `clips`.
#[derive(Debug, Default)]
pub struct LocaleStats {
    clips: u64,
    users: HashSet<String>,
    splits: DemographicSplits<u64>,
}

impl LocaleStats {
    pub fn record(&mut self, record: &ClipRecord) {
        self.clips += 1;
        self.users.insert(record.client_id.clone());

        let buckets = [
            (&mut self.splits.accent, record.accent.as_deref()),
            (&mut self.splits.age, record.age.as_deref()),
            (&mut self.splits.gender, record.gender.as_deref()),
        ];
        for (split, value) in buckets {
            *split.entry(value.unwrap_or_default().to_string()).or_default() += 1;
        }
    }

    pub fn clips(&self) -> u64 {
        self.clips
    }

    pub fn users(&self) -> usize {
        self.users.len()
    }

    pub fn splits(&self) -> &DemographicSplits<u64> {
        &self.splits
    }

    /// Convert counts into ratios rounded to `precision` decimals
    pub fn finalize(self, precision: u32) -> LocaleSummary {
        let clips = self.clips;
        let ratio = |counts: BTreeMap<String, u64>| -> BTreeMap<String, f64> {
            counts
                .into_iter()
                .map(|(bucket, count)| {
                    let value = if clips == 0 {
                        0.0
                    } else {
                        round_to(count as f64 / clips as f64, precision)
                    };
                    (bucket, value)
                })
                .collect()
        };

        LocaleSummary {
            clips,
            users: self.users.len() as u64,
            splits: DemographicSplits {
                accent: ratio(self.splits.accent),
                age: ratio(self.splits.age),
                gender: ratio(self.splits.gender),
            },
        }
    }
}

/// Finalized statistics for one locale
#[derive(Debug, Clone, PartialEq)]
pub struct LocaleSummary {
    pub clips: u64,
    pub users: u64,
    pub splits: DemographicSplits<f64>,
}

/// Per-locale accumulators for a run
#[derive(Debug, Default)]
pub struct ClipStats {
    locales: BTreeMap<String, LocaleStats>,
}

impl ClipStats {
    pub fn record(&mut self, record: &ClipRecord) {
        self.locales
            .entry(record.locale.clone())
            .or_default()
            .record(record);
    }

    pub fn locale(&self, locale: &str) -> Option<&LocaleStats> {
        self.locales.get(locale)
    }

    pub fn total_clips(&self) -> u64 {
        self.locales.values().map(LocaleStats::clips).sum()
    }

    pub fn finalize(self, precision: u32) -> BTreeMap<String, LocaleSummary> {
        self.locales
            .into_iter()
            .map(|(locale, stats)| (locale, stats.finalize(precision)))
            .collect()
    }
}

/// Statistics document of one locale in the release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocaleRelease {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clips: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splits: Option<DemographicSplits<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<u64>,
    /// Summed clip duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Data rows per split file, keyed by file stem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_sentences: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hrs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_hrs: Option<f64>,
}

impl From<LocaleSummary> for LocaleRelease {
    fn from(summary: LocaleSummary) -> Self {
        Self {
            clips: Some(summary.clips),
            splits: Some(summary.splits),
            users: Some(summary.users),
            ..Default::default()
        }
    }
}

macro_rules! take_newer {
    ($target:ident, $newer:ident, $($field:ident),+ $(,)?) => {
        $(
            if $newer.$field.is_some() {
                $target.$field = $newer.$field;
            }
        )+
    };
}

impl LocaleRelease {
    /// Overlay every field present in `newer`; bucket counts merge per key
    pub fn merge(&mut self, newer: LocaleRelease) {
        if let Some(buckets) = newer.buckets {
            self.buckets.get_or_insert_with(BTreeMap::new).extend(buckets);
        }
        take_newer!(
            self,
            newer,
            clips,
            splits,
            users,
            duration,
            reported_sentences,
            size,
            checksum,
            avg_duration_secs,
            valid_duration_secs,
            total_hrs,
            valid_hrs,
        );
    }

    pub fn set_archive(&mut self, metadata: &ArchiveMetadata) {
        self.size = Some(metadata.size);
        self.checksum = Some(metadata.checksum.clone());
    }

    fn compute_aggregates(&mut self, hour_digits: u32) {
        let clips = self.clips.unwrap_or(0);
        let duration = self.duration.unwrap_or(0.0);
        let validated = self
            .buckets
            .as_ref()
            .and_then(|b| b.get("validated"))
            .copied()
            .unwrap_or(0);

        let (avg, valid) = if clips == 0 {
            (0.0, 0.0)
        } else {
            let per_clip = duration / clips as f64;
            (
                per_clip.round() / 1000.0,
                (per_clip * validated as f64).round() / 1000.0,
            )
        };

        self.avg_duration_secs = Some(avg);
        self.valid_duration_secs = Some(valid);
        self.total_hrs = Some(unit_to_hours(duration, DurationUnit::Milliseconds, hour_digits));
        self.valid_hrs = Some(unit_to_hours(valid, DurationUnit::Seconds, hour_digits));
    }
}

/// The published statistics document of a release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStats {
    #[serde(
        rename = "bundleURLTemplate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bundle_url_template: Option<String>,
    #[serde(rename = "bundleURL", default, skip_serializing_if = "Option::is_none")]
    pub bundle_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<ArchiveMetadata>,
    #[serde(default)]
    pub locales: BTreeMap<String, LocaleRelease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_valid_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hrs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_valid_hrs: Option<f64>,
    /// Post-processing steps that failed, keyed by step name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

impl ReleaseStats {
    pub fn locale_mut(&mut self, locale: &str) -> &mut LocaleRelease {
        self.locales.entry(locale.to_string()).or_default()
    }

    /// Deep-merge `newer` into `self`, newer values winning
    pub fn merge(&mut self, newer: ReleaseStats) {
        for (locale, stats) in newer.locales {
            self.locale_mut(&locale).merge(stats);
        }
        self.errors.extend(newer.errors);
        take_newer!(
            self,
            newer,
            bundle_url_template,
            bundle_url,
            overall,
            total_duration,
            total_valid_duration_secs,
            total_hrs,
            total_valid_hrs,
        );
    }

    /// Compute per-locale and release-wide duration figures
    ///
    /// Derived fields are recomputed from the raw ones on every call, so
    /// calling this twice yields the same document.
    pub fn finalize(&mut self, locale_hour_digits: u32, total_hour_digits: u32) {
        let mut duration_sum = 0.0;
        let mut valid_sum = 0.0;

        for stats in self.locales.values_mut() {
            stats.compute_aggregates(locale_hour_digits);
            duration_sum += stats.duration.unwrap_or(0.0);
            valid_sum += stats.valid_duration_secs.unwrap_or(0.0);
        }

        let total_duration = duration_sum.floor();
        let total_valid = valid_sum.floor();

        self.total_duration = Some(total_duration);
        self.total_valid_duration_secs = Some(total_valid);
        self.total_hrs = Some(unit_to_hours(
            total_duration,
            DurationUnit::Milliseconds,
            total_hour_digits,
        ));
        self.total_valid_hrs = Some(unit_to_hours(
            total_valid,
            DurationUnit::Seconds,
            total_hour_digits,
        ));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Milliseconds,
    Seconds,
    Minutes,
}

impl DurationUnit {
    fn per_hour(self) -> f64 {
        match self {
            DurationUnit::Milliseconds => 3_600_000.0,
            DurationUnit::Seconds => 3_600.0,
            DurationUnit::Minutes => 60.0,
        }
    }
}

/// Convert a duration to hours, truncated to `digits` decimals
pub fn unit_to_hours(duration: f64, unit: DurationUnit, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    (duration / unit.per_hour() * scale).floor() / scale
}

fn round_to(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    (value * scale).round() / scale
}

/// File-backed statistics document of a release
pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted document; missing or corrupt files yield an empty one
    pub async fn load(&self) -> ReleaseStats {
        match read_json(&self.path).await {
            Ok(stats) => stats,
            Err(LedgerError::Io { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                debug!(path = %self.path.display(), "No stats document yet");
                ReleaseStats::default()
            }
            Err(e) => {
                warn!(error = %e, "Stats document unreadable, starting empty");
                ReleaseStats::default()
            }
        }
    }

    /// Merge `partial` over the persisted document and write it back
    ///
    /// Returns the merged document. Write failures are logged and the merged
    /// document is still returned.
    pub async fn save(&self, partial: ReleaseStats) -> ReleaseStats {
        let mut stats = self.load().await;
        stats.merge(partial);

        if let Err(e) = write_json_atomic(&self.path, &stats).await {
            warn!(error = %e, "Failed to persist stats document");
        }
        stats
    }

    /// Replace the persisted document
    pub async fn store(&self, stats: &ReleaseStats) -> Result<(), LedgerError> {
        write_json_atomic(&self.path, stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record(locale: &str, client_id: &str, age: Option<&str>) -> ClipRecord {
        ClipRecord {
            id: 1,
            client_id: client_id.to_string(),
            path: format!("{client_id}/1.mp3"),
            sentence: "Hi".to_string(),
            up_votes: None,
            down_votes: None,
            age: age.map(String::from),
            gender: Some("female".to_string()),
            accent: None,
            locale: locale.to_string(),
            segment: None,
        }
    }

    #[test]
    fn test_splits_sum_to_clip_count() {
        let mut stats = ClipStats::default();
        stats.record(&create_test_record("en", "a", Some("twenties")));
        stats.record(&create_test_record("en", "b", None));
        stats.record(&create_test_record("en", "a", Some("")));
        stats.record(&create_test_record("fr", "c", Some("forties")));

        let en = stats.locale("en").unwrap();
        assert_eq!(en.clips(), 3);
        assert_eq!(en.users(), 2);
        for split in [&en.splits().accent, &en.splits().age, &en.splits().gender] {
            assert_eq!(split.values().sum::<u64>(), en.clips());
        }
        assert_eq!(en.splits().age[""], 2);
        assert_eq!(stats.total_clips(), 4);
    }

    #[test]
    fn test_locale_finalize_ratios() {
        let mut stats = LocaleStats::default();
        stats.record(&create_test_record("en", "a", Some("twenties")));
        stats.record(&create_test_record("en", "b", Some("twenties")));
        stats.record(&create_test_record("en", "c", None));

        let summary = stats.finalize(2);
        assert_eq!(summary.clips, 3);
        assert_eq!(summary.users, 3);
        assert_eq!(summary.splits.age["twenties"], 0.67);
        assert_eq!(summary.splits.age[""], 0.33);
        assert_eq!(summary.splits.gender["female"], 1.0);
    }

    #[test]
    fn test_unit_to_hours_truncates() {
        assert_eq!(unit_to_hours(7_200_000.0, DurationUnit::Milliseconds, 2), 2.0);
        // 5399 s is 1.4997 h
        assert_eq!(unit_to_hours(5_399.0, DurationUnit::Seconds, 2), 1.49);
        assert_eq!(unit_to_hours(5_399.0, DurationUnit::Seconds, 0), 1.0);
        assert_eq!(unit_to_hours(90.0, DurationUnit::Minutes, 1), 1.5);
    }

    #[test]
    fn test_finalize_aggregates() {
        let mut stats = ReleaseStats::default();
        let en = stats.locale_mut("en");
        en.clips = Some(4);
        en.duration = Some(20_000.0);
        en.buckets = Some(BTreeMap::from([("validated".to_string(), 2)]));
        stats.locale_mut("fr").clips = Some(0);

        stats.finalize(2, 0);

        let en = &stats.locales["en"];
        assert_eq!(en.avg_duration_secs, Some(5.0));
        assert_eq!(en.valid_duration_secs, Some(10.0));
        assert_eq!(en.total_hrs, Some(0.0));
        let fr = &stats.locales["fr"];
        assert_eq!(fr.avg_duration_secs, Some(0.0));
        assert_eq!(fr.valid_duration_secs, Some(0.0));
        assert_eq!(stats.total_duration, Some(20_000.0));
        assert_eq!(stats.total_valid_duration_secs, Some(10.0));
        assert_eq!(stats.total_hrs, Some(0.0));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut stats = ReleaseStats::default();
        let en = stats.locale_mut("en");
        en.clips = Some(3);
        en.duration = Some(10_801_234.0);
        en.buckets = Some(BTreeMap::from([("validated".to_string(), 1)]));

        stats.finalize(2, 0);
        let once = stats.clone();
        stats.finalize(2, 0);

        assert_eq!(stats, once);
    }

    #[test]
    fn test_merge_newer_wins_and_keeps_older_fields() {
        let mut older = ReleaseStats::default();
        older.locale_mut("en").clips = Some(10);
        older.locale_mut("en").duration = Some(1.0);
        older.locale_mut("en").buckets =
            Some(BTreeMap::from([("train".to_string(), 4), ("dev".to_string(), 1)]));
        older.bundle_url = Some("old".to_string());

        let mut newer = ReleaseStats::default();
        newer.locale_mut("en").duration = Some(2.0);
        newer.locale_mut("en").buckets = Some(BTreeMap::from([("train".to_string(), 5)]));
        newer.locale_mut("de").clips = Some(1);

        older.merge(newer);

        let en = &older.locales["en"];
        assert_eq!(en.clips, Some(10));
        assert_eq!(en.duration, Some(2.0));
        let buckets = en.buckets.as_ref().unwrap();
        assert_eq!(buckets["train"], 5);
        assert_eq!(buckets["dev"], 1);
        assert_eq!(older.locales["de"].clips, Some(1));
        assert_eq!(older.bundle_url.as_deref(), Some("old"));
    }

    #[test]
    fn test_release_stats_json_field_names() {
        let mut stats = ReleaseStats {
            bundle_url_template: Some("https://x/rel/{locale}.tar.gz".to_string()),
            ..Default::default()
        };
        stats.locale_mut("en").reported_sentences = Some(2);
        stats.finalize(2, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("bundleURLTemplate").is_some());
        assert!(json.get("totalValidDurationSecs").is_some());
        assert!(json.get("totalHrs").is_some());
        assert_eq!(json["locales"]["en"]["reportedSentences"], 2);
        assert!(json["locales"]["en"].get("avgDurationSecs").is_some());
        assert!(json.get("errors").is_none());
    }

    #[tokio::test]
    async fn test_stats_store_load_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path().join("stats.json"));
        assert_eq!(store.load().await, ReleaseStats::default());

        tokio::fs::write(dir.path().join("stats.json"), b"[1, 2")
            .await
            .unwrap();
        assert_eq!(store.load().await, ReleaseStats::default());
    }

    #[tokio::test]
    async fn test_stats_store_save_merges_over_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path().join("stats.json"));

        let mut first = ReleaseStats::default();
        first.locale_mut("en").clips = Some(3);
        store.save(first).await;

        let mut second = ReleaseStats::default();
        second.locale_mut("en").duration = Some(9_000.0);
        let merged = store.save(second).await;

        assert_eq!(merged.locales["en"].clips, Some(3));
        assert_eq!(store.load().await, merged);
    }
}
