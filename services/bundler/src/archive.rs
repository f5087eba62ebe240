//! Release archives.
//!
//! Each archive goes through tar+gzip to `<release>/tarballs/<label>.tar.gz`,
//! a multipart upload to `<release>/<label>.tar.gz`, a remote size check and
//! finally an entry in the upload ledger. A ledger entry short-circuits the
//! whole sequence, which is what makes a restarted release cheap.

use crate::layout::ReleaseLayout;
use crate::ledger::{ArchiveMetadata, UploadLedger};
use crate::object_store::{ObjectStore, StoreError, UploadedPart};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File as StdFile;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Bytes written between two progress updates while compressing
const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

/// Errors raised while producing or uploading an archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Upload failed: {0}")]
    Store(#[from] StoreError),

    #[error("Archive task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Remote size of {key} is {remote} bytes, expected {local}")]
    SizeMismatch { key: String, local: u64, remote: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleMode {
    /// Every locale in one archive named after the release
    Single,
    /// One archive per locale, uploaded one after the other
    PerLocale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BundleOutcome {
    Single(ArchiveMetadata),
    PerLocale(BTreeMap<String, ArchiveMetadata>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePhase {
    Compressing,
    Uploading,
}

/// Byte count of the archive currently being produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveProgress {
    pub label: String,
    pub phase: ArchivePhase,
    pub bytes: u64,
}

impl Default for ArchiveProgress {
    fn default() -> Self {
        Self {
            label: String::new(),
            phase: ArchivePhase::Compressing,
            bytes: 0,
        }
    }
}

impl fmt::Display for ArchiveProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.phase {
            ArchivePhase::Compressing => "archiving",
            ArchivePhase::Uploading => "uploading",
        };
        write!(
            f,
            "{verb} {}: {:.1} MB",
            self.label,
            self.bytes as f64 / (1024.0 * 1024.0)
        )
    }
}

pub struct ArchiveUploader {
    store: Arc<dyn ObjectStore>,
    layout: ReleaseLayout,
    ledger: UploadLedger,
    part_size: usize,
    progress: Arc<watch::Sender<ArchiveProgress>>,
}

impl ArchiveUploader {
    /// Create an uploader, loading the release's upload ledger
    pub async fn new(store: Arc<dyn ObjectStore>, layout: ReleaseLayout, part_size: usize) -> Self {
        let ledger = UploadLedger::load(layout.upload_ledger_path()).await;
        let (progress, _) = watch::channel(ArchiveProgress::default());

        debug!(entries = ledger.len(), "Upload ledger loaded");

        Self {
            store,
            layout,
            ledger,
            part_size: part_size.max(1),
            progress: Arc::new(progress),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ArchiveProgress> {
        self.progress.subscribe()
    }

    /// Ledger key of an archive: `<release>-<label>`
    pub fn ledger_key(&self, label: &str) -> String {
        format!("{}-{label}", self.layout.release_name())
    }

    /// Archive `locales` according to `mode`
    ///
    /// Per-locale archives are produced strictly in the given order and the
    /// first failure stops the sequence; finished archives stay in the ledger.
    pub async fn bundle(
        &mut self,
        mode: BundleMode,
        locales: &[String],
    ) -> Result<BundleOutcome, ArchiveError> {
        match mode {
            BundleMode::Single => {
                let label = self.layout.release_name().to_string();
                let metadata = self.archive(&label, locales).await?;
                Ok(BundleOutcome::Single(metadata))
            }
            BundleMode::PerLocale => {
                let mut archives = BTreeMap::new();
                for locale in locales {
                    let metadata = self.archive(locale, std::slice::from_ref(locale)).await?;
                    archives.insert(locale.clone(), metadata);
                }
                Ok(BundleOutcome::PerLocale(archives))
            }
        }
    }

    /// Produce, upload and record one archive over the given locale dirs
    #[instrument(skip(self, locales), fields(release = %self.layout.release_name()))]
    pub async fn archive(
        &mut self,
        label: &str,
        locales: &[String],
    ) -> Result<ArchiveMetadata, ArchiveError> {
        let ledger_key = self.ledger_key(label);
        if let Some(metadata) = self.ledger.get(&ledger_key) {
            info!(
                label = %label,
                size_bytes = metadata.size,
                "Archive already uploaded, reusing ledger entry"
            );
            return Ok(metadata.clone());
        }

        let local_path = self.layout.archive_path(label);
        let local_size = self.compress(label, locales, &local_path).await?;
        info!(label = %label, size_bytes = local_size, "Archive created");

        let remote_key = self.layout.archive_key(label);
        let start = Instant::now();
        let checksum = self.upload(label, &local_path, &remote_key).await?;

        let remote_size = self.store.head_object(&remote_key).await?;
        if remote_size != local_size {
            return Err(ArchiveError::SizeMismatch {
                key: remote_key,
                local: local_size,
                remote: remote_size,
            });
        }

        metrics::histogram!("bundler.archive.upload.duration_seconds")
            .record(start.elapsed().as_secs_f64());
        metrics::counter!("bundler.archive.bytes_uploaded").increment(local_size);

        let metadata = ArchiveMetadata {
            size: local_size,
            checksum,
        };
        if let Err(e) = self.ledger.record(&ledger_key, metadata.clone()).await {
            warn!(error = %e, label = %label, "Failed to persist upload ledger");
        }

        info!(
            label = %label,
            key = %remote_key,
            checksum = %metadata.checksum,
            "Archive uploaded and verified"
        );
        Ok(metadata)
    }

    async fn compress(
        &self,
        label: &str,
        locales: &[String],
        dest: &Path,
    ) -> Result<u64, ArchiveError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let sources: Vec<(String, PathBuf)> = locales
            .iter()
            .map(|locale| {
                (
                    format!("{}/{locale}", self.layout.release_name()),
                    self.layout.locale_dir(locale),
                )
            })
            .collect();

        let progress = Arc::clone(&self.progress);
        let label = label.to_string();
        let dest = dest.to_path_buf();

        let size = tokio::task::spawn_blocking(move || {
            write_tarball(&sources, &dest, |bytes| {
                progress.send_replace(ArchiveProgress {
                    label: label.clone(),
                    phase: ArchivePhase::Compressing,
                    bytes,
                });
            })
        })
        .await??;

        Ok(size)
    }

    /// Multipart upload of `path`, returning the SHA-256 of the bytes sent
    async fn upload(&self, label: &str, path: &Path, key: &str) -> Result<String, ArchiveError> {
        let upload_id = self.store.create_multipart_upload(key).await?;

        match self.upload_parts(label, path, key, &upload_id).await {
            Ok((parts, checksum)) => {
                self.store
                    .complete_multipart_upload(key, &upload_id, parts)
                    .await?;
                Ok(checksum)
            }
            Err(e) => {
                if let Err(abort_err) = self.store.abort_multipart_upload(key, &upload_id).await {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        label: &str,
        path: &Path,
        key: &str,
        upload_id: &str,
    ) -> Result<(Vec<UploadedPart>, String), ArchiveError> {
        let mut file = File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut parts = Vec::new();
        let mut sent = 0u64;
        let mut part_number = 1i32;

        loop {
            let mut chunk = Vec::with_capacity(self.part_size);
            (&mut file)
                .take(self.part_size as u64)
                .read_to_end(&mut chunk)
                .await?;

            // An empty file still needs one (empty) part
            if chunk.is_empty() && !parts.is_empty() {
                break;
            }
            let last = chunk.len() < self.part_size;

            hasher.update(&chunk);
            sent += chunk.len() as u64;
            let part = self
                .store
                .upload_part(key, upload_id, part_number, Bytes::from(chunk))
                .await?;
            parts.push(part);
            part_number += 1;

            self.progress.send_replace(ArchiveProgress {
                label: label.to_string(),
                phase: ArchivePhase::Uploading,
                bytes: sent,
            });

            if last {
                break;
            }
        }

        debug!(key = %key, parts = parts.len(), size_bytes = sent, "Parts uploaded");
        Ok((parts, hex::encode(hasher.finalize())))
    }
}

/// Byte-counting writer reporting at most once per progress step
struct CountingWriter<W, F> {
    inner: W,
    written: u64,
    reported: u64,
    on_progress: F,
}

impl<W: Write, F: FnMut(u64)> Write for CountingWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        if self.written - self.reported >= PROGRESS_STEP_BYTES {
            self.reported = self.written;
            (self.on_progress)(self.written);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write a gzipped tar of `sources` (`(name in archive, local dir)`) to `dest`
fn write_tarball<F: FnMut(u64)>(
    sources: &[(String, PathBuf)],
    dest: &Path,
    on_progress: F,
) -> io::Result<u64> {
    let counting = CountingWriter {
        inner: BufWriter::new(StdFile::create(dest)?),
        written: 0,
        reported: 0,
        on_progress,
    };

    let mut builder = tar::Builder::new(GzEncoder::new(counting, Compression::default()));
    for (name, dir) in sources {
        builder.append_dir_all(name, dir)?;
    }

    let mut counting = builder.into_inner()?.finish()?;
    counting.flush()?;
    (counting.on_progress)(counting.written);
    counting.inner.get_ref().sync_all()?;

    Ok(counting.written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::memory::MemoryStore;
    use crate::object_store::MockObjectStore;
    use flate2::read::GzDecoder;

    fn layout(root: &Path) -> ReleaseLayout {
        ReleaseLayout::new(root, "rel", "common_voice", "mp3")
    }

    async fn create_locale(layout: &ReleaseLayout, locale: &str, clips: usize) {
        let clips_dir = layout.clips_dir(locale);
        tokio::fs::create_dir_all(&clips_dir).await.unwrap();
        for id in 0..clips {
            let name = layout.clip_file_name(locale, id as i64);
            tokio::fs::write(clips_dir.join(name), vec![id as u8; 700])
                .await
                .unwrap();
        }
        tokio::fs::write(layout.locale_dir(locale).join("train.tsv"), "h\nrow\n")
            .await
            .unwrap();
    }

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut reader = tar::Archive::new(GzDecoder::new(archive));
        reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_ledger_hit_makes_no_network_calls() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let metadata = ArchiveMetadata {
            size: 1234,
            checksum: "feed".to_string(),
        };
        let mut ledger = UploadLedger::load(layout.upload_ledger_path()).await;
        ledger.record("rel-en", metadata.clone()).await.unwrap();

        // No expectations: any store call panics
        let store = Arc::new(MockObjectStore::new());
        let mut uploader = ArchiveUploader::new(store, layout.clone(), 64).await;

        let outcome = uploader
            .bundle(BundleMode::PerLocale, &["en".to_string()])
            .await
            .unwrap();

        let expected = BTreeMap::from([("en".to_string(), metadata)]);
        assert_eq!(outcome, BundleOutcome::PerLocale(expected));
        assert!(!layout.archive_path("en").exists());
    }

    #[tokio::test]
    async fn test_upload_checksum_matches_local_archive() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        create_locale(&layout, "en", 3).await;

        let store = Arc::new(MemoryStore::new());
        let mut uploader = ArchiveUploader::new(store.clone(), layout.clone(), 64).await;
        let metadata = uploader.archive("en", &["en".to_string()]).await.unwrap();

        let local = tokio::fs::read(layout.archive_path("en")).await.unwrap();
        assert_eq!(metadata.size, local.len() as u64);
        assert_eq!(metadata.checksum, hex::encode(Sha256::digest(&local)));

        let remote = store.get("rel/en.tar.gz").unwrap();
        assert_eq!(remote.as_ref(), local.as_slice());
        assert!(store.part_uploads.load(std::sync::atomic::Ordering::SeqCst) > 1);

        let names = entry_names(&local);
        assert!(names.iter().any(|n| n == "rel/en/clips/common_voice_en_0.mp3"));
        assert!(names.iter().any(|n| n == "rel/en/train.tsv"));
    }

    #[tokio::test]
    async fn test_second_archive_call_reuses_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        create_locale(&layout, "en", 1).await;

        let store = Arc::new(MemoryStore::new());
        let mut uploader = ArchiveUploader::new(store.clone(), layout.clone(), 1024).await;
        let first = uploader.archive("en", &["en".to_string()]).await.unwrap();
        let parts = store.part_uploads.load(std::sync::atomic::Ordering::SeqCst);

        // A fresh uploader reads the persisted ledger
        let mut restarted = ArchiveUploader::new(store.clone(), layout, 1024).await;
        let second = restarted.archive("en", &["en".to_string()]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            store.part_uploads.load(std::sync::atomic::Ordering::SeqCst),
            parts
        );
    }

    #[tokio::test]
    async fn test_single_bundle_contains_every_locale() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        create_locale(&layout, "en", 1).await;
        create_locale(&layout, "fr", 1).await;

        let store = Arc::new(MemoryStore::new());
        let mut uploader = ArchiveUploader::new(store.clone(), layout.clone(), 4096).await;
        let outcome = uploader
            .bundle(BundleMode::Single, &["en".to_string(), "fr".to_string()])
            .await
            .unwrap();

        assert!(matches!(outcome, BundleOutcome::Single(_)));
        let names = entry_names(&store.get("rel/rel.tar.gz").unwrap());
        assert!(names.iter().any(|n| n.starts_with("rel/en/")));
        assert!(names.iter().any(|n| n.starts_with("rel/fr/")));

        let ledger = UploadLedger::load(layout.upload_ledger_path()).await;
        assert!(ledger.get("rel-rel").is_some());
    }

    #[tokio::test]
    async fn test_size_mismatch_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        create_locale(&layout, "en", 1).await;

        let mut mock = MockObjectStore::new();
        mock.expect_create_multipart_upload()
            .times(1)
            .returning(|_| Ok("upload-1".to_string()));
        mock.expect_upload_part().returning(|_, _, part_number, _| {
            Ok(UploadedPart {
                part_number,
                e_tag: "etag".to_string(),
            })
        });
        mock.expect_complete_multipart_upload()
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_head_object().returning(|_| Ok(1));

        let mut uploader = ArchiveUploader::new(Arc::new(mock), layout.clone(), 4096).await;
        let err = uploader.archive("en", &["en".to_string()]).await.unwrap_err();

        assert!(matches!(err, ArchiveError::SizeMismatch { remote: 1, .. }));
        let ledger = UploadLedger::load(layout.upload_ledger_path()).await;
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_failed_part_aborts_upload() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        create_locale(&layout, "en", 1).await;

        let mut mock = MockObjectStore::new();
        mock.expect_create_multipart_upload()
            .returning(|_| Ok("upload-1".to_string()));
        mock.expect_upload_part().returning(|key, _, _, _| {
            Err(StoreError::Request {
                key: key.to_string(),
                message: "slow down".to_string(),
            })
        });
        mock.expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut uploader = ArchiveUploader::new(Arc::new(mock), layout, 4096).await;
        let err = uploader.archive("en", &["en".to_string()]).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Store(_)));
    }

    #[test]
    fn test_counting_writer_reports_in_steps() {
        let mut reports = Vec::new();
        {
            let mut writer = CountingWriter {
                inner: Vec::new(),
                written: 0,
                reported: 0,
                on_progress: |bytes| reports.push(bytes),
            };
            let block = vec![0u8; 512 * 1024];
            for _ in 0..5 {
                writer.write_all(&block).unwrap();
            }
            assert_eq!(writer.written, 5 * 512 * 1024);
        }
        assert_eq!(reports, vec![1024 * 1024, 2 * 1024 * 1024]);
    }

    #[test]
    fn test_progress_display() {
        let progress = ArchiveProgress {
            label: "en".to_string(),
            phase: ArchivePhase::Uploading,
            bytes: 3 * 1024 * 1024,
        };
        assert_eq!(progress.to_string(), "uploading en: 3.0 MB");
    }
}
