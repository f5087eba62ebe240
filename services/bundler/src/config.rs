use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a loaded configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the bundler
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Catalog database configuration
    pub database: DatabaseConfig,
    /// Bucket holding the raw clip recordings
    pub clip_bucket: BucketConfig,
    /// Bucket receiving archives and the stats document
    pub bundle_bucket: BucketConfig,
    /// Release naming and output location
    pub release: ReleaseConfig,
    /// Row processing policy
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Archive bundling mode
    #[serde(default)]
    pub bundling: BundlingConfig,
    /// External tools invoked during post-processing
    #[serde(default)]
    pub corpora: CorporaConfig,
    /// Per-step skip switches
    #[serde(default)]
    pub skip: SkipConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port; no exporter is installed when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Catalog database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// MySQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// SQL file selecting the clips of the release
    #[serde(default = "default_query_file")]
    pub query_file: PathBuf,
    /// SQL file selecting reported sentences
    #[serde(default = "default_reported_query_file")]
    pub reported_sentences_query_file: PathBuf,
    /// Only clips created before this instant are bundled
    pub cutoff_time: DateTime<Utc>,
}

/// Object store bucket configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Bucket name
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Part size for multipart uploads in bytes (5MB minimum)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Base URL for public links; defaults to the virtual-hosted S3 URL
    pub public_url_base: Option<String>,
}

/// Release naming and output location
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseConfig {
    /// Release name, also the remote key prefix
    pub name: String,
    /// Directory under which the release directory is created
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

/// Row processing policy
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Objects at or below this many bytes are rejected as blank recordings
    #[serde(default = "default_min_clip_bytes")]
    pub min_clip_bytes: u64,
    /// Locales with fewer distinct speakers than this are scrubbed
    #[serde(default = "default_minority_speaker_threshold")]
    pub minority_speaker_threshold: u64,
    /// In-flight operation count above which the row stream is paused
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// In-flight operation count below which the row stream resumes
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    /// Local clip file name prefix
    #[serde(default = "default_clip_prefix")]
    pub clip_prefix: String,
    /// Local clip file extension
    #[serde(default = "default_clip_extension")]
    pub clip_extension: String,
    /// Decimal places kept in demographic ratios
    #[serde(default = "default_ratio_precision")]
    pub ratio_precision: u32,
    /// Decimal places kept (truncated) in per-locale hour figures
    #[serde(default = "default_locale_hour_digits")]
    pub locale_hour_digits: u32,
    /// Decimal places kept (truncated) in release-wide hour figures
    #[serde(default)]
    pub total_hour_digits: u32,
}

/// Archive bundling mode
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundlingConfig {
    /// Bundle every locale into one archive named after the release
    #[serde(default)]
    pub single_bundle: bool,
}

/// External tools invoked during post-processing
#[derive(Debug, Clone, Deserialize)]
pub struct CorporaConfig {
    /// Corpus split command; receives `-f <clips.tsv> -d <release dir> -v`
    #[serde(default = "default_split_command")]
    pub split_command: String,
    /// Duration sum command; receives the clips directory, prints milliseconds
    #[serde(default = "default_duration_command")]
    pub duration_command: String,
}

/// Per-step skip switches
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkipConfig {
    #[serde(default)]
    pub bundling: bool,
    #[serde(default)]
    pub corpora_split: bool,
    #[serde(default)]
    pub reported_sentences: bool,
    #[serde(default)]
    pub minority_check: bool,
    #[serde(default)]
    pub download: bool,
    #[serde(default)]
    pub hashing: bool,
    #[serde(default)]
    pub durations: bool,
}

// Default value functions
fn default_service_name() -> String {
    "corpus-bundler".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_query_file() -> PathBuf {
    PathBuf::from("queries/bundle_clips.sql")
}

fn default_reported_query_file() -> PathBuf {
    PathBuf::from("queries/reported_sentences.sql")
}

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_output_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_min_clip_bytes() -> u64 {
    256
}

fn default_minority_speaker_threshold() -> u64 {
    5
}

fn default_high_watermark() -> usize {
    50
}

fn default_low_watermark() -> usize {
    25
}

fn default_clip_prefix() -> String {
    "common_voice".to_string()
}

fn default_clip_extension() -> String {
    "mp3".to_string()
}

fn default_ratio_precision() -> u32 {
    2
}

fn default_locale_hour_digits() -> u32 {
    2
}

fn default_split_command() -> String {
    "create-corpora".to_string()
}

fn default_duration_command() -> String {
    "mp3-duration-sum".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "corpus-bundler")?
            .set_default("service.log_level", "info")?
            // Add config file if present
            .add_source(config::File::with_name("config/bundler").required(false))
            .add_source(
                config::File::with_name("/etc/corpus-bundler/bundler").required(false),
            )
            // Override with environment variables
            // BUNDLER__RELEASE__NAME -> release.name
            .add_source(
                config::Environment::with_prefix("BUNDLER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.release.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired("release.name".to_string()));
        }

        // A zero low mark never lets a paused row stream resume
        if self.processing.low_watermark == 0 {
            return Err(ConfigError::InvalidValue {
                key: "processing.low_watermark".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.processing.low_watermark >= self.processing.high_watermark {
            return Err(ConfigError::InvalidValue {
                key: "processing.low_watermark".to_string(),
                message: format!(
                    "must be below processing.high_watermark ({})",
                    self.processing.high_watermark
                ),
            });
        }

        // S3 rejects non-final parts under 5MB
        for (key, bucket) in [
            ("clip_bucket", &self.clip_bucket),
            ("bundle_bucket", &self.bundle_bucket),
        ] {
            if bucket.part_size_bytes < 5 * 1024 * 1024 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{key}.part_size_bytes"),
                    message: "must be at least 5MB".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Local directory holding everything produced for this release
    pub fn release_dir(&self) -> PathBuf {
        self.release.output_root.join(&self.release.name)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }
}

impl BucketConfig {
    /// Public URL prefix for objects in this bucket
    pub fn public_base(&self) -> String {
        match self.public_url_base {
            Some(ref base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}.s3.amazonaws.com", self.bucket),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: None,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            min_clip_bytes: default_min_clip_bytes(),
            minority_speaker_threshold: default_minority_speaker_threshold(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            clip_prefix: default_clip_prefix(),
            clip_extension: default_clip_extension(),
            ratio_precision: default_ratio_precision(),
            locale_hour_digits: default_locale_hour_digits(),
            total_hour_digits: 0,
        }
    }
}

impl Default for CorporaConfig {
    fn default() -> Self {
        Self {
            split_command: default_split_command(),
            duration_command: default_duration_command(),
        }
    }
}
