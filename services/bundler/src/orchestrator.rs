//! Release orchestration.
//!
//! Stages run in a fixed order:
//!
//! ```text
//! Initializing ─► RowProcessing ─► PostProcessing ─► StatsFinalize ─► Published ─► Terminated
//!                                   ├ durations
//!                                   ├ reported sentences
//!                                   └ corpora split ─► bucket count ─► archive
//! ```
//!
//! Failures in Initializing, RowProcessing and Published abort the run. Stats
//! writes are best effort; the in-memory document is what gets published.
//! Post-processing steps run concurrently; a failing step is recorded in the
//! stats document under `errors` and the remaining steps continue.

use crate::archive::{ArchiveUploader, BundleMode, BundleOutcome};
use crate::catalog::{load_query, CatalogDb, ReportedSentenceSource};
use crate::classifier::ClipClassifier;
use crate::config::{Config, ProcessingConfig};
use crate::corpora;
use crate::layout::ReleaseLayout;
use crate::object_store::{ObjectStore, S3Bucket};
use crate::pipeline::{PipelineOptions, PipelineOutcome, RowPipeline};
use crate::progress::ProgressRenderer;
use crate::stats::{LocaleRelease, ReleaseStats, StatsStore};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStage {
    Initializing,
    RowProcessing,
    PostProcessing,
    StatsFinalize,
    Published,
    Terminated,
}

/// Post-processing step names, as recorded under `errors`
pub mod steps {
    pub const DURATIONS: &str = "durations";
    pub const REPORTED_SENTENCES: &str = "reportedSentences";
    pub const CORPORA_SPLIT: &str = "corporaSplit";
    pub const BUCKET_COUNT: &str = "bucketCount";
    pub const ARCHIVE: &str = "archive";
}

/// Summary of a completed run
#[derive(Debug)]
pub struct RunReport {
    pub stats: ReleaseStats,
    pub rows_seen: u64,
    pub clips_saved: u64,
}

impl RunReport {
    /// A post-processing step failed
    pub fn has_failures(&self) -> bool {
        !self.stats.errors.is_empty()
    }
}

/// Partial results of post-processing plus the steps that failed
#[derive(Debug, Default)]
struct StepResults {
    stats: ReleaseStats,
    errors: BTreeMap<String, String>,
}

impl StepResults {
    fn record_failure(&mut self, step: &str, err: impl fmt::Display) {
        warn!(step = step, error = %err, "Post-processing step failed");
        self.errors.insert(step.to_string(), err.to_string());
    }

    fn absorb(&mut self, other: StepResults) {
        self.stats.merge(other.stats);
        self.errors.extend(other.errors);
    }
}

pub struct ReleaseOrchestrator {
    config: Config,
    layout: ReleaseLayout,
    catalog: CatalogDb,
    clip_store: Arc<dyn ObjectStore>,
    bundle_store: Arc<dyn ObjectStore>,
    stats_store: StatsStore,
    stage: ReleaseStage,
}

impl ReleaseOrchestrator {
    /// Create the release directory and connect to every collaborator
    ///
    /// Fails if the database or either bucket is unreachable.
    pub async fn initialize(config: Config) -> Result<Self> {
        info!(
            stage = ?ReleaseStage::Initializing,
            release = %config.release.name,
            "Entering stage"
        );

        let layout = ReleaseLayout::new(
            &config.release.output_root,
            &config.release.name,
            &config.processing.clip_prefix,
            &config.processing.clip_extension,
        );
        tokio::fs::create_dir_all(layout.root())
            .await
            .with_context(|| format!("Failed to create {}", layout.root().display()))?;

        let catalog = CatalogDb::new(&config.database)
            .await
            .context("Failed to connect to catalog database")?;
        catalog.ping().await.context("Catalog database unreachable")?;

        let clip_store: Arc<dyn ObjectStore> =
            Arc::new(S3Bucket::new(&config.clip_bucket, false).await);
        let bundle_store: Arc<dyn ObjectStore> =
            Arc::new(S3Bucket::new(&config.bundle_bucket, true).await);

        clip_store
            .check_bucket()
            .await
            .context("Clip bucket unreachable")?;
        bundle_store
            .check_bucket()
            .await
            .context("Bundle bucket unreachable")?;

        let stats_store = StatsStore::new(layout.stats_path());

        Ok(Self {
            config,
            layout,
            catalog,
            clip_store,
            bundle_store,
            stats_store,
            stage: ReleaseStage::Initializing,
        })
    }

    fn enter(&mut self, stage: ReleaseStage) {
        info!(
            from = ?self.stage,
            stage = ?stage,
            release = %self.layout.release_name(),
            "Entering stage"
        );
        self.stage = stage;
    }

    /// Run every remaining stage and close all connections
    pub async fn run(mut self) -> Result<RunReport> {
        let result = self.execute().await;

        self.enter(ReleaseStage::Terminated);
        self.catalog.close().await;

        result
    }

    async fn execute(&mut self) -> Result<RunReport> {
        self.enter(ReleaseStage::RowProcessing);
        let outcome = self.process_rows().await?;

        let mut partial = ReleaseStats::default();
        for (locale, summary) in outcome.locales {
            partial.locales.insert(locale, LocaleRelease::from(summary));
        }
        // The returned document stays authoritative even if the write failed
        let saved = self.stats_store.save(partial).await;

        self.enter(ReleaseStage::PostProcessing);
        let results = self.post_process().await?;

        self.enter(ReleaseStage::StatsFinalize);
        let stats = finalize_stats(saved, results, &self.config.processing);
        if let Err(e) = self.stats_store.store(&stats).await {
            warn!(error = %e, "Failed to persist release stats");
        }

        self.publish(&stats).await?;

        Ok(RunReport {
            stats,
            rows_seen: outcome.rows_seen,
            clips_saved: outcome.clips_saved,
        })
    }

    #[instrument(skip(self))]
    async fn process_rows(&self) -> Result<PipelineOutcome> {
        let minority = if self.config.skip.minority_check {
            HashSet::new()
        } else {
            self.catalog
                .minority_locales(self.config.processing.minority_speaker_threshold)
                .await
                .context("Failed to load minority locales")?
        };

        let sql = load_query(&self.config.database.query_file).await?;
        let pipeline = RowPipeline::new(
            Arc::clone(&self.clip_store),
            self.layout.clone(),
            ClipClassifier::new(self.config.processing.min_clip_bytes, minority),
            PipelineOptions::from_config(&self.config),
        );

        let renderer = ProgressRenderer::spawn(pipeline.subscribe());
        let outcome = pipeline.run(self.catalog.stream_clips(&sql)).await;
        renderer.finish();

        let outcome = outcome.context("Row processing failed")?;

        // Later steps work on locale directories, even when nothing was downloaded
        for locale in outcome.locales.keys() {
            tokio::fs::create_dir_all(self.layout.locale_dir(locale)).await?;
        }

        Ok(outcome)
    }

    async fn post_process(&self) -> Result<StepResults> {
        PostProcessor {
            config: &self.config,
            layout: &self.layout,
            bundle_store: Arc::clone(&self.bundle_store),
            reports: &self.catalog,
        }
        .run()
        .await
    }

    async fn publish(&mut self, stats: &ReleaseStats) -> Result<()> {
        self.enter(ReleaseStage::Published);

        let body = serde_json::to_vec(stats).context("Failed to serialize release stats")?;
        let key = self.layout.stats_key();
        self.bundle_store
            .put_object(&key, Bytes::from(body))
            .await
            .with_context(|| format!("Failed to publish {key}"))?;

        info!(key = %key, locales = stats.locales.len(), "Release stats published");
        Ok(())
    }
}

/// Post-processing steps over a populated release directory
struct PostProcessor<'a> {
    config: &'a Config,
    layout: &'a ReleaseLayout,
    bundle_store: Arc<dyn ObjectStore>,
    reports: &'a dyn ReportedSentenceSource,
}

impl PostProcessor<'_> {
    async fn run(&self) -> Result<StepResults> {
        let locales = self
            .layout
            .locale_dirs()
            .await
            .context("Failed to list locale directories")?;

        let (durations, reported, corpora) = tokio::join!(
            self.collect_durations(&locales),
            self.collect_reported_sentences(&locales),
            self.split_count_and_archive(),
        );

        let mut results = StepResults::default();
        results.absorb(durations);
        results.absorb(reported);
        results.absorb(corpora);
        Ok(results)
    }

    async fn collect_durations(&self, locales: &[String]) -> StepResults {
        let mut results = StepResults::default();
        if self.config.skip.durations {
            return results;
        }

        for locale in locales {
            let clips_dir = self.layout.clips_dir(locale);
            match corpora::sum_durations(&self.config.corpora.duration_command, &clips_dir).await {
                Ok(duration) => results.stats.locale_mut(locale).duration = Some(duration),
                Err(e) => {
                    results.record_failure(steps::DURATIONS, format!("{locale}: {e}"));
                    break;
                }
            }
        }
        results
    }

    async fn collect_reported_sentences(&self, locales: &[String]) -> StepResults {
        let mut results = StepResults::default();
        if self.config.skip.reported_sentences {
            return results;
        }

        let counts = async {
            let sql = load_query(&self.config.database.reported_sentences_query_file).await?;
            let reported = self.reports.reported_sentences(&sql).await?;
            let counts = corpora::write_reported_sentences(&self.layout, &reported, locales).await?;
            anyhow::Ok(counts)
        }
        .await;

        match counts {
            Ok(counts) => {
                for (locale, count) in counts {
                    results.stats.locale_mut(&locale).reported_sentences = Some(count);
                }
            }
            Err(e) => results.record_failure(steps::REPORTED_SENTENCES, format!("{e:#}")),
        }
        results
    }

    async fn split_count_and_archive(&self) -> StepResults {
        let mut results = StepResults::default();

        if !self.config.skip.corpora_split {
            if let Err(e) =
                corpora::run_corpora_split(&self.config.corpora.split_command, &self.layout).await
            {
                results.record_failure(steps::CORPORA_SPLIT, e);
                return results;
            }
        }

        // The split may have added locale directories
        let locales = match self.layout.locale_dirs().await {
            Ok(locales) => locales,
            Err(e) => {
                results.record_failure(steps::BUCKET_COUNT, e);
                return results;
            }
        };

        for locale in &locales {
            match corpora::count_buckets(&self.layout.locale_dir(locale)).await {
                Ok(buckets) => results.stats.locale_mut(locale).buckets = Some(buckets),
                Err(e) => {
                    results.record_failure(steps::BUCKET_COUNT, format!("{locale}: {e}"));
                    return results;
                }
            }
        }

        if self.config.skip.bundling {
            return results;
        }

        let mode = if self.config.bundling.single_bundle {
            BundleMode::Single
        } else {
            BundleMode::PerLocale
        };
        let mut uploader = ArchiveUploader::new(
            Arc::clone(&self.bundle_store),
            self.layout.clone(),
            self.config.bundle_bucket.part_size_bytes,
        )
        .await;

        let renderer = ProgressRenderer::spawn(uploader.subscribe());
        let bundled = uploader.bundle(mode, &locales).await;
        renderer.finish();

        match bundled {
            Ok(outcome) => apply_bundle_outcome(
                &mut results.stats,
                outcome,
                &self.config.bundle_bucket.public_base(),
                self.layout.release_name(),
            ),
            Err(e) => results.record_failure(steps::ARCHIVE, e),
        }
        results
    }
}

/// Merge post-processing results over the document saved after row processing
fn finalize_stats(
    mut stats: ReleaseStats,
    results: StepResults,
    processing: &ProcessingConfig,
) -> ReleaseStats {
    stats.merge(results.stats);
    // Only this run's failures are reported
    stats.errors = results.errors;
    stats.finalize(processing.locale_hour_digits, processing.total_hour_digits);
    stats
}

/// Fold archive metadata and public URLs into the stats document
pub fn apply_bundle_outcome(
    stats: &mut ReleaseStats,
    outcome: BundleOutcome,
    public_base: &str,
    release: &str,
) {
    match outcome {
        BundleOutcome::Single(metadata) => {
            stats.bundle_url = Some(format!("{public_base}/{release}/{release}.tar.gz"));
            stats.overall = Some(metadata);
        }
        BundleOutcome::PerLocale(archives) => {
            stats.bundle_url_template = Some(format!("{public_base}/{release}/{{locale}}.tar.gz"));
            for (locale, metadata) in archives {
                stats.locale_mut(&locale).set_archive(&metadata);
            }
        }
    }
}
