//! Corpus Bundler
//!
//! Builds dataset releases from the clip catalog. The bundler streams the
//! release's clip rows from MySQL, validates and downloads each recording from
//! the clip bucket, writes a tab-separated manifest with per-locale statistics,
//! then archives the release directory and uploads it to the bundle bucket with
//! resumable, checksum-verified transfers.
//!
//! ## Features
//!
//! - **Backpressured row processing**: the row stream is only polled while the
//!   number of in-flight lookups, downloads and manifest writes stays under a
//!   high/low watermark pair
//! - **Restartable**: clips already on disk skip every network call; archives
//!   recorded in the upload ledger are never rebuilt or re-uploaded
//! - **Demographic scrubbing**: locales with too few speakers lose their age
//!   and gender columns
//! - **Release statistics**: per-locale ratios, durations, bucket counts and
//!   archive checksums, published as `stats.json`
//!
//! ## Architecture
//!
//! ```text
//! MySQL catalog              Clip bucket               Bundle bucket
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ clips        │           │ {client}/    │          │ {release}/   │
//! │ locales      │           │   {clip}.mp3 │          │   *.tar.gz   │
//! └──────────────┘           └──────────────┘          │   stats.json │
//!        │ row stream               │ head/get          └──────────────┘
//!        ▼                          ▼                         ▲
//! ┌──────────────┐           ┌──────────────┐                │
//! │ Row          │──────────▶│ Clip         │                │
//! │ Pipeline     │           │ Classifier   │                │
//! └──────────────┘           └──────────────┘                │
//!        │                                                    │
//!        ▼                                                    │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ clips.tsv    │──────────▶│ Corpora      │─────────▶│ Archive      │
//! │ errors.json  │           │ split/counts │          │ Uploader     │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!                                   │
//!                                   ▼
//!                            ┌──────────────┐
//!                            │ Stats        │
//!                            │ Store        │
//!                            └──────────────┘
//! ```

pub mod archive;
pub mod backpressure;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod corpora;
pub mod layout;
pub mod ledger;
pub mod manifest;
pub mod object_store;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod stats;

pub use archive::{ArchiveError, ArchiveUploader, BundleMode, BundleOutcome};
pub use backpressure::{BackpressureController, FlowSignal, Operation};
pub use catalog::{CatalogDb, CatalogError, ClipRecord, ReportedSentence, ReportedSentenceSource};
pub use classifier::{ClipClassifier, ClipDecision};
pub use config::Config;
pub use layout::ReleaseLayout;
pub use ledger::{ArchiveMetadata, ErrorLedger, LedgerError, UploadLedger};
pub use manifest::ManifestWriter;
pub use object_store::{ObjectStore, S3Bucket, StoreError};
pub use orchestrator::{ReleaseOrchestrator, ReleaseStage, RunReport};
pub use pipeline::{PipelineError, PipelineOptions, RowPipeline};
pub use stats::{ClipStats, LocaleStats, ReleaseStats, StatsStore};
