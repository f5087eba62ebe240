//! Object store access for clip downloads and release uploads.
//!
//! The pipeline and the archive uploader only see the [`ObjectStore`] trait so
//! they can be exercised against an in-memory store in tests. [`S3Bucket`] is
//! the production implementation, one instance per bucket.

use crate::config::BucketConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Errors returned by object store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store request failed for {key}: {message}")]
    Request { key: String, message: String },

    #[error("Local I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    fn request(key: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Request {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// A part acknowledged by a multipart upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// Operations the bundler needs from a bucket
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fail unless the bucket is reachable with the configured credentials
    async fn check_bucket(&self) -> Result<(), StoreError>;

    /// Size in bytes of the object, or `StoreError::NotFound`
    async fn head_object(&self, key: &str) -> Result<u64, StoreError>;

    /// Stream the object into `dest`, returning the number of bytes written
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StoreError>;

    /// Single request upload for small documents
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;
}

/// S3 bucket handle
pub struct S3Bucket {
    client: S3Client,
    bucket: String,
    public_writes: bool,
}

impl S3Bucket {
    /// Create a new bucket handle
    ///
    /// Objects written through a handle created with `public_writes` are
    /// uploaded with the `public-read` canned ACL.
    pub async fn new(config: &BucketConfig, public_writes: bool) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_writes = public_writes,
            "S3 bucket initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            public_writes,
        }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn acl(&self) -> Option<ObjectCannedAcl> {
        self.public_writes.then_some(ObjectCannedAcl::PublicRead)
    }
}

#[async_trait]
impl ObjectStore for S3Bucket {
    async fn check_bucket(&self) -> Result<(), StoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StoreError::request(&self.bucket, e.into_service_error()))?;

        debug!(bucket = %self.bucket, "Bucket reachable");
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<u64, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(output
                .content_length()
                .and_then(|len| u64::try_from(len).ok())
                .unwrap_or(0)),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Err(StoreError::NotFound(key.to_string()))
                } else {
                    Err(StoreError::request(key, e.into_service_error()))
                }
            }
        }
    }

    #[instrument(skip(self, dest), fields(bucket = %self.bucket))]
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::request(key, err)
                }
            })?;

        let mut body = output.body;
        let mut file = File::create(dest).await?;
        let mut written = 0u64;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StoreError::request(key, e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type_for(key))
            .set_acl(self.acl())
            .send()
            .await
            .map_err(|e| StoreError::request(key, e.into_service_error()))?;

        info!(key = %key, size_bytes = size, "Object uploaded");
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .set_acl(self.acl())
            .send()
            .await
            .map_err(|e| StoreError::request(key, e.into_service_error()))?;

        response
            .upload_id()
            .map(String::from)
            .ok_or_else(|| StoreError::request(key, "no upload ID in response"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::request(key, e.into_service_error()))?;

        Ok(UploadedPart {
            part_number,
            e_tag: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        let completed_parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.e_tag)
                    .build()
            })
            .collect();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| StoreError::request(key, e.into_service_error()))?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StoreError::request(key, e.into_service_error()))?;

        Ok(())
    }
}

/// Get content type for an uploaded key
fn content_type_for(key: &str) -> &'static str {
    let key = key.to_lowercase();
    if key.ends_with(".tar.gz") || key.ends_with(".tgz") {
        "application/gzip"
    } else if key.ends_with(".json") {
        "application/json"
    } else if key.ends_with(".tsv") {
        "text/tab-separated-values"
    } else {
        "application/octet-stream"
    }
}

/// In-memory store used by pipeline and archive tests
#[cfg(test)]
pub(crate) mod memory {
    use super::{ObjectStore, StoreError, UploadedPart};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        objects: Mutex<HashMap<String, Bytes>>,
        uploads: Mutex<HashMap<String, Vec<(i32, Bytes)>>>,
        failing_heads: Mutex<Vec<String>>,
        pub head_calls: AtomicUsize,
        heads_in_flight: AtomicUsize,
        peak_heads: AtomicUsize,
        pub downloads: AtomicUsize,
        pub part_uploads: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, key: &str, body: impl Into<Bytes>) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), body.into());
        }

        pub fn get(&self, key: &str) -> Option<Bytes> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        /// Make head requests for `key` fail with a request error
        pub fn fail_head(&self, key: &str) {
            self.failing_heads.lock().unwrap().push(key.to_string());
        }

        pub fn head_count(&self) -> usize {
            self.head_calls.load(Ordering::SeqCst)
        }

        pub fn download_count(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }

        /// Most head requests ever pending at the same time
        pub fn peak_concurrent_heads(&self) -> usize {
            self.peak_heads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn check_bucket(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn head_object(&self, key: &str) -> Result<u64, StoreError> {
            self.head_calls.fetch_add(1, Ordering::SeqCst);
            let pending = self.heads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_heads.fetch_max(pending, Ordering::SeqCst);

            // Stay pending across a few polls so the caller can overlap requests
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }

            let result = if self.failing_heads.lock().unwrap().iter().any(|k| k == key) {
                Err(StoreError::Request {
                    key: key.to_string(),
                    message: "connection reset".to_string(),
                })
            } else {
                self.objects
                    .lock()
                    .unwrap()
                    .get(key)
                    .map(|body| body.len() as u64)
                    .ok_or_else(|| StoreError::NotFound(key.to_string()))
            };

            self.heads_in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn download(&self, key: &str, dest: &Path) -> Result<u64, StoreError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let body = self
                .get(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            tokio::fs::write(dest, &body).await?;
            Ok(body.len() as u64)
        }

        async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
            self.insert(key, body);
            Ok(())
        }

        async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError> {
            let upload_id = format!("upload-{key}");
            self.uploads
                .lock()
                .unwrap()
                .insert(upload_id.clone(), Vec::new());
            Ok(upload_id)
        }

        async fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> Result<UploadedPart, StoreError> {
            self.part_uploads.fetch_add(1, Ordering::SeqCst);
            let mut uploads = self.uploads.lock().unwrap();
            let parts = uploads.get_mut(upload_id).ok_or_else(|| StoreError::Request {
                key: key.to_string(),
                message: "unknown upload".to_string(),
            })?;
            parts.push((part_number, body));
            Ok(UploadedPart {
                part_number,
                e_tag: format!("etag-{part_number}"),
            })
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: Vec<UploadedPart>,
        ) -> Result<(), StoreError> {
            let mut staged = self
                .uploads
                .lock()
                .unwrap()
                .remove(upload_id)
                .unwrap_or_default();
            staged.sort_by_key(|(number, _)| *number);

            if staged.len() != parts.len() {
                return Err(StoreError::Request {
                    key: key.to_string(),
                    message: "part list mismatch".to_string(),
                });
            }

            let mut body = Vec::new();
            for (_, chunk) in staged {
                body.extend_from_slice(&chunk);
            }
            self.insert(key, body);
            Ok(())
        }

        async fn abort_multipart_upload(
            &self,
            _key: &str,
            upload_id: &str,
        ) -> Result<(), StoreError> {
            self.uploads.lock().unwrap().remove(upload_id);
            Ok(())
        }
    }
}
