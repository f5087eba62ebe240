//! Tab-separated clip manifest.
//!
//! Lines are handed to a dedicated writer task over a channel so the row
//! pipeline never blocks on disk. Each queued line yields an acknowledgement
//! future that resolves once the line has reached the buffered file, which is
//! what the pipeline counts as an in-flight write.

use crate::catalog::ClipRecord;
use sha2::{Digest, Sha512};
use std::future::Future;
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

pub const MANIFEST_COLUMNS: [&str; 11] = [
    "id",
    "client_id",
    "path",
    "sentence",
    "up_votes",
    "down_votes",
    "age",
    "gender",
    "accent",
    "locale",
    "segment",
];

/// Replace every whitespace character with a single space
pub fn normalize_sentence(sentence: &str) -> String {
    sentence
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect()
}

/// SHA-512 hex digest of a client identifier
pub fn hash_client_id(client_id: &str) -> String {
    hex::encode(Sha512::digest(client_id.as_bytes()))
}

/// Render one manifest line, newline included
///
/// `file_name` replaces the remote object path so the manifest points at the
/// local copy.
pub fn format_row(record: &ClipRecord, file_name: &str, hash_client_ids: bool) -> String {
    let client_id = if hash_client_ids {
        hash_client_id(&record.client_id)
    } else {
        record.client_id.clone()
    };

    let fields = [
        record.id.to_string(),
        client_id,
        file_name.to_string(),
        normalize_sentence(&record.sentence),
        opt_field(record.up_votes),
        opt_field(record.down_votes),
        plain_field(record.age.as_deref()),
        plain_field(record.gender.as_deref()),
        plain_field(record.accent.as_deref()),
        plain_field(Some(&record.locale)),
        plain_field(record.segment.as_deref()),
    ];

    let mut line = fields.join("\t");
    line.push('\n');
    line
}

fn opt_field(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// Free-text columns cannot carry the delimiter or line breaks
fn plain_field(value: Option<&str>) -> String {
    value.map(normalize_sentence).unwrap_or_default()
}

struct ManifestLine {
    line: String,
    ack: oneshot::Sender<io::Result<()>>,
}

/// Handle to the manifest writer task
pub struct ManifestWriter {
    tx: mpsc::UnboundedSender<ManifestLine>,
    task: JoinHandle<io::Result<u64>>,
    hash_client_ids: bool,
}

impl ManifestWriter {
    /// Create (truncate) the manifest and write its header
    pub async fn create(path: &Path, hash_client_ids: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut writer = BufWriter::new(File::create(path).await?);
        let mut header = MANIFEST_COLUMNS.join("\t");
        header.push('\n');
        writer.write_all(header.as_bytes()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(writer, rx));

        debug!(path = %path.display(), hash_client_ids, "Manifest opened");

        Ok(Self {
            tx,
            task,
            hash_client_ids,
        })
    }

    /// Queue a row, returning a future that resolves once it is written
    pub fn write(
        &self,
        record: &ClipRecord,
        file_name: &str,
    ) -> impl Future<Output = io::Result<()>> + Send + 'static {
        let line = format_row(record, file_name, self.hash_client_ids);
        let (ack, done) = oneshot::channel();
        // A closed channel drops `ack`, which surfaces below as BrokenPipe
        let _ = self.tx.send(ManifestLine { line, ack });

        async move {
            done.await.unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "manifest writer stopped",
                ))
            })
        }
    }

    /// Flush and close the manifest, returning the number of data rows
    pub async fn close(self) -> io::Result<u64> {
        drop(self.tx);
        self.task.await.map_err(io::Error::other)?
    }
}

async fn run_writer(
    mut writer: BufWriter<File>,
    mut rx: mpsc::UnboundedReceiver<ManifestLine>,
) -> io::Result<u64> {
    let mut rows = 0u64;

    while let Some(ManifestLine { line, ack }) = rx.recv().await {
        match writer.write_all(line.as_bytes()).await {
            Ok(()) => {
                rows += 1;
                let _ = ack.send(Ok(()));
            }
            Err(e) => {
                let kind = e.kind();
                let _ = ack.send(Err(e));
                return Err(io::Error::new(kind, "manifest write failed"));
            }
        }
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(rows)
}
