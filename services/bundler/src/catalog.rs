use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the catalog database
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to read query file {path}: {source}")]
    QueryFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One clip row selected for the release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ClipRecord {
    /// Catalog clip ID
    pub id: i64,
    /// Speaker client identifier
    pub client_id: String,
    /// Object key of the recording in the clip bucket
    pub path: String,
    /// Prompted sentence
    pub sentence: String,
    #[sqlx(default)]
    pub up_votes: Option<i64>,
    #[sqlx(default)]
    pub down_votes: Option<i64>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub accent: Option<String>,
    pub locale: String,
    #[sqlx(default)]
    pub segment: Option<String>,
}

/// A sentence reported by contributors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ReportedSentence {
    pub sentence_id: String,
    pub sentence: String,
    pub locale: String,
    pub reason: String,
}

/// Reported sentence lookups made during post-processing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReportedSentenceSource: Send + Sync {
    /// Run `sql` and group the reported sentences by locale
    async fn reported_sentences(
        &self,
        sql: &str,
    ) -> Result<BTreeMap<String, Vec<ReportedSentence>>, CatalogError>;
}

/// Locales with fewer distinct speakers than the bound parameter
const MINORITY_LOCALES_QUERY: &str = r#"
    SELECT locales.name AS locale
    FROM clips
    JOIN locales ON locales.id = clips.locale_id
    WHERE clips.created_at < ?
    GROUP BY locales.name
    HAVING COUNT(DISTINCT clips.client_id) < ?
"#;

/// Read-only access to the clip catalog
pub struct CatalogDb {
    pool: MySqlPool,
    cutoff_time: DateTime<Utc>,
}

impl CatalogDb {
    /// Create a new catalog handle with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, CatalogError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!(cutoff_time = %config.cutoff_time, "Connected to catalog database");

        Ok(Self {
            pool,
            cutoff_time: config.cutoff_time,
        })
    }

    /// Fail unless a trivial round trip succeeds
    pub async fn ping(&self) -> Result<(), CatalogError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Stream the release's clip rows in query order
    ///
    /// The query receives the cutoff time as its only parameter. Rows are
    /// pulled from the server as the stream is polled; a consumer that stops
    /// polling holds the result set open without losing rows.
    pub fn stream_clips<'a>(
        &'a self,
        sql: &'a str,
    ) -> BoxStream<'a, Result<ClipRecord, CatalogError>> {
        sqlx::query_as::<_, ClipRecord>(sql)
            .bind(self.cutoff_time)
            .fetch(&self.pool)
            .map_err(CatalogError::from)
            .boxed()
    }

    /// Locales whose distinct speaker count is below `threshold`
    #[instrument(skip(self))]
    pub async fn minority_locales(&self, threshold: u64) -> Result<HashSet<String>, CatalogError> {
        let threshold = i64::try_from(threshold).unwrap_or(i64::MAX);
        let rows: Vec<(String,)> = sqlx::query_as(MINORITY_LOCALES_QUERY)
            .bind(self.cutoff_time)
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;

        let locales: HashSet<String> = rows.into_iter().map(|(locale,)| locale).collect();
        info!(count = locales.len(), threshold = threshold, "Minority locales loaded");
        Ok(locales)
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ReportedSentenceSource for CatalogDb {
    #[instrument(skip(self, sql))]
    async fn reported_sentences(
        &self,
        sql: &str,
    ) -> Result<BTreeMap<String, Vec<ReportedSentence>>, CatalogError> {
        let mut rows = sqlx::query_as::<_, ReportedSentence>(sql).fetch(&self.pool);
        let mut by_locale: BTreeMap<String, Vec<ReportedSentence>> = BTreeMap::new();

        while let Some(row) = rows.next().await {
            let row = row?;
            by_locale.entry(row.locale.clone()).or_default().push(row);
        }

        debug!(locales = by_locale.len(), "Reported sentences loaded");
        Ok(by_locale)
    }
}

/// Read a SQL file, failing with the offending path
pub async fn load_query(path: &Path) -> Result<String, CatalogError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CatalogError::QueryFile {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_query_missing_file() {
        let err = load_query(Path::new("/nonexistent/bundle_clips.sql"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bundle_clips.sql"));
    }

    #[test]
    fn test_clip_record_deserialize_nullable_demographics() {
        let json = r#"{
            "id": 7,
            "client_id": "abc",
            "path": "abc/7.mp3",
            "sentence": "Hello",
            "up_votes": 2,
            "down_votes": null,
            "age": null,
            "gender": "female",
            "accent": null,
            "locale": "en",
            "segment": null
        }"#;

        let record: ClipRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.age, None);
        assert_eq!(record.gender.as_deref(), Some("female"));
        assert_eq!(record.up_votes, Some(2));
    }
}
