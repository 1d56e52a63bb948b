//! Object store seam and its S3 implementation.

use crate::config::StoreConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Maximum keys accepted by one `DeleteObjects` request.
const DELETE_BATCH_SIZE: usize = 1000;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: i64,
}

impl ObjectEntry {
    pub fn new(key: impl Into<String>, size: i64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }
}

/// A single bucket of an object store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Stream one object to `local_path`, creating parent directories.
    /// Returns the number of bytes written.
    async fn download(&self, key: &str, local_path: &Path) -> Result<u64>;

    /// Store the file at `local_path` under `key`, replacing any existing object.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;

    /// Delete every object in the bucket. Returns the number deleted.
    async fn delete_all(&self) -> Result<usize>;
}

/// S3 (or S3-compatible) bucket.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a client for the bucket described by `config`.
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "bagframes-config",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/Ceph
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("Failed to list objects in {}", self.bucket))?;

            entries.extend(response.contents().iter().filter_map(|obj| {
                obj.key()
                    .map(|key| ObjectEntry::new(key, obj.size().unwrap_or_default()))
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(count = entries.len(), "Objects listed");
        Ok(entries)
    }

    #[instrument(skip(self, local_path), fields(bucket = %self.bucket))]
    async fn download(&self, key: &str, local_path: &Path) -> Result<u64> {
        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get object {}", key))?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .with_context(|| format!("Failed to create {}", local_path.display()))?;

        let mut written = 0u64;
        while let Some(bytes) = object
            .body
            .try_next()
            .await
            .with_context(|| format!("Failed to read body of {}", key))?
        {
            file.write_all(&bytes)
                .await
                .with_context(|| format!("Failed to write {}", local_path.display()))?;
            written += bytes.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    #[instrument(skip(self, local_path), fields(bucket = %self.bucket))]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(get_content_type(local_path))
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", key))?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete_all(&self) -> Result<usize> {
        let entries = self.list("").await?;
        let mut deleted = 0;

        for batch in entries.chunks(DELETE_BATCH_SIZE) {
            let objects = batch
                .iter()
                .map(|entry| ObjectIdentifier::builder().key(&entry.key).build())
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to build delete request")?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .context("Failed to build delete request")?;

            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .with_context(|| format!("Failed to delete objects in {}", self.bucket))?;

            for error in response.errors() {
                warn!(
                    key = ?error.key(),
                    message = ?error.message(),
                    "Failed to delete object"
                );
            }
            deleted += batch.len().saturating_sub(response.errors().len());
        }

        Ok(deleted)
    }
}

/// Content type from a file extension.
pub fn get_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();

    match ext.as_str() {
        "png" => "image/png",
        "jpeg" | "jpg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}
