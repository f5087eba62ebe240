//! Row pipeline.
//!
//! A single driver loop owns every piece of row state: the backpressure
//! counters, the statistics accumulator and the error ledger. Object lookups,
//! downloads and manifest writes run as futures inside the loop's
//! `FuturesUnordered` and hand their outcome back to it, so no counter is ever
//! updated from two places at once.
//!
//! ```text
//!  row stream ──poll (unless paused)──► handle_row
//!                                        │ local file present? ── yes ──► accept
//!                                        ▼ no
//!                                     head_object ──► Lookup outcome
//!                                                      ├─ NotFound ─► notFound
//!                                                      ├─ too small ► tooSmall
//!                                                      └─ accepted ─► accept + download
//!  accept: stats.record + manifest write (ack future)
//! ```

use crate::backpressure::{BackpressureController, FlowSignal, Operation};
use crate::catalog::{CatalogError, ClipRecord};
use crate::classifier::{ClipClassifier, ClipDecision};
use crate::config::Config;
use crate::ledger::ErrorLedger;
use crate::layout::ReleaseLayout;
use crate::manifest::ManifestWriter;
use crate::object_store::{ObjectStore, StoreError};
use crate::stats::{ClipStats, LocaleSummary};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Errors that abort row processing
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Row stream failed: {0}")]
    RowStream(#[from] CatalogError),

    #[error("Manifest write failed: {0}")]
    Manifest(#[source] io::Error),

    #[error("Download of {key} failed: {source}")]
    Download {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Local I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Row stream paused with nothing in flight after {rows_seen} rows")]
    Stalled { rows_seen: u64 },
}

/// Row processing switches
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub skip_download: bool,
    pub hash_client_ids: bool,
    pub ratio_precision: u32,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            skip_download: config.skip.download,
            hash_client_ids: !config.skip.hashing,
            ratio_precision: config.processing.ratio_precision,
            high_watermark: config.processing.high_watermark,
            low_watermark: config.processing.low_watermark,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_download: false,
            hash_client_ids: true,
            ratio_precision: 2,
            high_watermark: 50,
            low_watermark: 25,
        }
    }
}

/// Rows read vs clips present on local disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowProgress {
    pub rows_seen: u64,
    pub clips_saved: u64,
}

impl fmt::Display for RowProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows processed: {}, clips saved: {}",
            self.rows_seen, self.clips_saved
        )
    }
}

/// Result of a completed row processing stage
#[derive(Debug)]
pub struct PipelineOutcome {
    pub locales: BTreeMap<String, LocaleSummary>,
    pub errors: ErrorLedger,
    pub rows_seen: u64,
    pub clips_saved: u64,
}

enum Outcome {
    Lookup {
        record: ClipRecord,
        file_name: String,
        result: Result<u64, StoreError>,
    },
    Downloaded {
        key: String,
        result: Result<u64, StoreError>,
    },
    Written(io::Result<()>),
}

pub struct RowPipeline {
    store: Arc<dyn ObjectStore>,
    layout: ReleaseLayout,
    classifier: ClipClassifier,
    options: PipelineOptions,
    progress: watch::Sender<RowProgress>,
}

impl RowPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: ReleaseLayout,
        classifier: ClipClassifier,
        options: PipelineOptions,
    ) -> Self {
        let (progress, _) = watch::channel(RowProgress::default());
        Self {
            store,
            layout,
            classifier,
            options,
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RowProgress> {
        self.progress.subscribe()
    }

    /// Consume `rows` until the stream ends and every operation settled
    #[instrument(skip_all, fields(release = %self.layout.release_name()))]
    pub async fn run<S>(&self, rows: S) -> Result<PipelineOutcome, PipelineError>
    where
        S: Stream<Item = Result<ClipRecord, CatalogError>> + Unpin,
    {
        let writer =
            ManifestWriter::create(&self.layout.manifest_path(), self.options.hash_client_ids)
                .await
                .map_err(PipelineError::Manifest)?;

        let mut driver = Driver {
            pipeline: self,
            writer,
            backpressure: BackpressureController::new(
                self.options.high_watermark,
                self.options.low_watermark,
            ),
            stats: ClipStats::default(),
            errors: ErrorLedger::default(),
            in_flight: FuturesUnordered::new(),
            progress: RowProgress::default(),
        };

        let mut rows = rows;
        let mut stream_done = false;

        loop {
            if stream_done && driver.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(outcome) = driver.in_flight.next(), if !driver.in_flight.is_empty() => {
                    driver.handle_outcome(outcome).await?;
                }
                row = rows.next(), if !stream_done && !driver.backpressure.is_paused() => {
                    match row {
                        Some(record) => driver.handle_row(record?).await?,
                        None => {
                            debug!(rows_seen = driver.progress.rows_seen, "Row stream ended");
                            stream_done = true;
                        }
                    }
                }
                // Only reachable while paused with nothing left to resume the stream
                else => {
                    return Err(PipelineError::Stalled {
                        rows_seen: driver.progress.rows_seen,
                    });
                }
            }
        }

        driver.finish().await
    }
}

struct Driver<'a> {
    pipeline: &'a RowPipeline,
    writer: ManifestWriter,
    backpressure: BackpressureController,
    stats: ClipStats,
    errors: ErrorLedger,
    in_flight: FuturesUnordered<BoxFuture<'static, Outcome>>,
    progress: RowProgress,
}

impl Driver<'_> {
    async fn handle_row(&mut self, record: ClipRecord) -> Result<(), PipelineError> {
        self.progress.rows_seen += 1;
        metrics::counter!("bundler.rows.processed").increment(1);

        let pipeline = self.pipeline;
        let record = pipeline.classifier.scrub(record);
        let file_name = pipeline.layout.clip_file_name(&record.locale, record.id);
        let local_path = pipeline.layout.clip_path(&record.locale, &file_name);

        if is_materialized(&local_path).await {
            self.progress.clips_saved += 1;
            self.accept(&record, &file_name);
        } else {
            let store = Arc::clone(&pipeline.store);
            self.start(Operation::Remote);
            self.in_flight.push(
                async move {
                    let result = store.head_object(&record.path).await;
                    Outcome::Lookup {
                        record,
                        file_name,
                        result,
                    }
                }
                .boxed(),
            );
        }

        self.publish();
        Ok(())
    }

    async fn handle_outcome(&mut self, outcome: Outcome) -> Result<(), PipelineError> {
        match outcome {
            Outcome::Lookup {
                record,
                file_name,
                result,
            } => {
                self.finish_op(Operation::Remote);
                self.handle_lookup(record, file_name, result);
            }
            Outcome::Downloaded { key, result } => {
                self.finish_op(Operation::Remote);
                let bytes = result.map_err(|source| PipelineError::Download { key, source })?;
                self.progress.clips_saved += 1;
                metrics::counter!("bundler.clips.downloaded").increment(1);
                debug!(size_bytes = bytes, "Clip downloaded");
            }
            Outcome::Written(result) => {
                self.finish_op(Operation::Write);
                result.map_err(PipelineError::Manifest)?;
            }
        }

        self.publish();
        Ok(())
    }

    fn handle_lookup(
        &mut self,
        record: ClipRecord,
        file_name: String,
        result: Result<u64, StoreError>,
    ) {
        let size = match result {
            Ok(size) => size,
            Err(e) => {
                if !matches!(e, StoreError::NotFound(_)) {
                    warn!(key = %record.path, error = %e, "Clip lookup failed");
                }
                self.errors.record_not_found(&record.locale, &record.path);
                metrics::counter!("bundler.clips.rejected", "reason" => "not_found").increment(1);
                return;
            }
        };

        match self.pipeline.classifier.classify(size) {
            ClipDecision::TooSmall { size } => {
                self.errors.record_too_small(&record.locale, &record.path, size);
                metrics::counter!("bundler.clips.rejected", "reason" => "too_small").increment(1);
            }
            ClipDecision::Accepted => {
                self.accept(&record, &file_name);
                if !self.pipeline.options.skip_download {
                    let store = Arc::clone(&self.pipeline.store);
                    let dest = self.pipeline.layout.clip_path(&record.locale, &file_name);
                    let key = record.path;
                    self.start(Operation::Remote);
                    self.in_flight.push(
                        async move {
                            let result = fetch_clip(store.as_ref(), &key, &dest).await;
                            Outcome::Downloaded { key, result }
                        }
                        .boxed(),
                    );
                }
            }
        }
    }

    fn accept(&mut self, record: &ClipRecord, file_name: &str) {
        self.stats.record(record);

        let written = self.writer.write(record, file_name);
        self.start(Operation::Write);
        self.in_flight.push(written.map(Outcome::Written).boxed());
    }

    fn start(&mut self, op: Operation) {
        let signal = self.backpressure.on_start(op);
        self.log_signal(signal);
    }

    fn finish_op(&mut self, op: Operation) {
        let signal = self.backpressure.on_finish(op);
        self.log_signal(signal);
    }

    fn log_signal(&self, signal: FlowSignal) {
        match signal {
            FlowSignal::Pause => debug!(
                active_remote = self.backpressure.active_remote(),
                active_writes = self.backpressure.active_writes(),
                "Pausing row stream"
            ),
            FlowSignal::Resume => debug!("Resuming row stream"),
            FlowSignal::NoAction => {}
        }
    }

    fn publish(&self) {
        let progress = self.progress;
        self.pipeline.progress.send_replace(progress);
    }

    async fn finish(self) -> Result<PipelineOutcome, PipelineError> {
        let rows_written = self.writer.close().await.map_err(PipelineError::Manifest)?;
        let errors_path = self.pipeline.layout.errors_path();

        if let Err(e) = self.errors.flush(&errors_path).await {
            warn!(error = %e, "Failed to write error ledger");
        }

        for (locale, (too_small, not_found)) in self.errors.summary() {
            warn!(locale = %locale, too_small, not_found, "Clips rejected");
        }

        info!(
            rows_seen = self.progress.rows_seen,
            manifest_rows = rows_written,
            accepted = self.stats.total_clips(),
            clips_saved = self.progress.clips_saved,
            too_small = self.errors.too_small_count(),
            not_found = self.errors.not_found_count(),
            "Row processing complete"
        );

        Ok(PipelineOutcome {
            locales: self.stats.finalize(self.pipeline.options.ratio_precision),
            errors: self.errors,
            rows_seen: self.progress.rows_seen,
            clips_saved: self.progress.clips_saved,
        })
    }
}

async fn is_materialized(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

/// Download into `<dest>.part` and rename into place
///
/// A failed download never leaves a file at `dest`.
async fn fetch_clip(store: &dyn ObjectStore, key: &str, dest: &Path) -> Result<u64, StoreError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let part = part_path(dest);
    let result = match store.download(key, &part).await {
        Ok(bytes) => tokio::fs::rename(&part, dest)
            .await
            .map(|_| bytes)
            .map_err(StoreError::from),
        Err(e) => Err(e),
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}
