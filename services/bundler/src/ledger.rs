//! Durable JSON records of a run: rejected clips and completed uploads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while persisting a JSON document
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Write `value` as JSON next to `path` then rename it into place
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let body = serde_json::to_vec(value).map_err(|source| LedgerError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let io_err = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &body).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;

    debug!(path = %path.display(), size_bytes = body.len(), "JSON document written");
    Ok(())
}

/// Read a JSON document, failing on a missing or malformed file
pub async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LedgerError> {
    let body = tokio::fs::read(path).await.map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_slice(&body).map_err(|source| LedgerError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// A rejected clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Object key in the clip bucket
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Clips rejected during row processing, keyed by locale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLedger {
    pub too_small: BTreeMap<String, Vec<ErrorEntry>>,
    pub not_found: BTreeMap<String, Vec<ErrorEntry>>,
}

impl ErrorLedger {
    pub fn record_too_small(&mut self, locale: &str, path: &str, size: u64) {
        self.too_small
            .entry(locale.to_string())
            .or_default()
            .push(ErrorEntry {
                path: path.to_string(),
                size: Some(size),
            });
    }

    pub fn record_not_found(&mut self, locale: &str, path: &str) {
        self.not_found
            .entry(locale.to_string())
            .or_default()
            .push(ErrorEntry {
                path: path.to_string(),
                size: None,
            });
    }

    pub fn too_small_count(&self) -> usize {
        self.too_small.values().map(Vec::len).sum()
    }

    pub fn not_found_count(&self) -> usize {
        self.not_found.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.too_small.is_empty() && self.not_found.is_empty()
    }

    /// Per-locale `(too_small, not_found)` counts
    pub fn summary(&self) -> BTreeMap<String, (usize, usize)> {
        let mut summary: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for (locale, entries) in &self.too_small {
            summary.entry(locale.clone()).or_default().0 = entries.len();
        }
        for (locale, entries) in &self.not_found {
            summary.entry(locale.clone()).or_default().1 = entries.len();
        }
        summary
    }

    pub async fn flush(&self, path: &Path) -> Result<(), LedgerError> {
        write_json_atomic(path, self).await
    }
}

/// Size and checksum of an uploaded archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub size: u64,
    pub checksum: String,
}

/// Archives already uploaded and verified, keyed by ledger key
#[derive(Debug)]
pub struct UploadLedger {
    path: PathBuf,
    entries: BTreeMap<String, ArchiveMetadata>,
}

impl UploadLedger {
    /// Load the ledger; a missing or unreadable file yields an empty ledger
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_json(&path).await {
            Ok(entries) => entries,
            Err(LedgerError::Io { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                BTreeMap::new()
            }
            Err(e) => {
                warn!(error = %e, "Upload ledger unreadable, starting empty");
                BTreeMap::new()
            }
        };

        Self { path, entries }
    }

    pub fn get(&self, key: &str) -> Option<&ArchiveMetadata> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a verified upload and persist the whole ledger
    ///
    /// The entry stays in memory even when persisting fails.
    pub async fn record(&mut self, key: &str, metadata: ArchiveMetadata) -> Result<(), LedgerError> {
        self.entries.insert(key.to_string(), metadata);
        write_json_atomic(&self.path, &self.entries).await
    }
}
