use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::Bucket;
use tracing::debug;

use super::multipart::StreamingTransfer;
use super::{BlobStore, StoreError, StoreResult};
use crate::config::Config;

/// Blob store backed by an S3-compatible bucket.
///
/// Every key is stored under the configured key prefix. File uploads and
/// copies go through [`StreamingTransfer`] so packs above the single-request
/// limit are handled.
#[derive(Clone)]
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    transfer: StreamingTransfer,
    prefix: String,
    endpoint: Option<String>,
}

impl S3BlobStore {
    /// Create a new S3 blob store from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or the bucket handle cannot
    /// be created.
    pub async fn new(config: &Config) -> Result<Self> {
        let bucket_name = config
            .s3_bucket
            .as_deref()
            .context("S3_BUCKET not set")?;
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?;
        let secret_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;

        let credentials = Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)
            .context("Failed to create S3 credentials")?;

        let region = if let Some(ref endpoint) = config.s3_endpoint {
            Region::Custom {
                region: config.s3_region.clone(),
                endpoint: endpoint.clone(),
            }
        } else {
            config.s3_region.parse().unwrap_or(Region::UsEast1)
        };

        let bucket =
            Bucket::new(bucket_name, region, credentials).context("Failed to create S3 bucket")?;

        // Use path-style for custom endpoints (MinIO, R2, etc.)
        let bucket = if config.s3_endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        let transfer = StreamingTransfer::new(config)
            .await
            .context("Failed to create streaming S3 client")?;

        Ok(Self {
            bucket,
            transfer,
            prefix: config.s3_prefix.clone(),
            endpoint: config.s3_endpoint.clone(),
        })
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn check_status(code: u16, key: &str) -> StoreResult<()> {
        match code {
            200..=299 => Ok(()),
            404 => Err(StoreError::NotFound(key.to_string())),
            429 | 500..=599 => Err(StoreError::Transient(format!("HTTP {code} for {key}"))),
            _ => Err(StoreError::Backend(format!("HTTP {code} for {key}"))),
        }
    }
}

/// Classify an S3 client error.
fn map_error(e: S3Error, key: &str) -> StoreError {
    match e {
        S3Error::HttpFailWithBody(code, body) => match code {
            404 => StoreError::NotFound(key.to_string()),
            429 | 500..=599 => StoreError::Transient(format!("HTTP {code} for {key}: {body}")),
            _ => StoreError::Backend(format!("HTTP {code} for {key}: {body}")),
        },
        // Connection-level failures
        other => StoreError::Transient(format!("S3 request for {key} failed: {other}")),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_root(&self) -> StoreResult<()> {
        // Prefixes need no creation; listing verifies credentials and bucket.
        self.bucket
            .list(self.prefix.clone(), Some("/".to_string()))
            .await
            .map_err(|e| map_error(e, &self.prefix))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let object_key = self.object_key(key);
        match self.bucket.head_object(&object_key).await {
            Ok((_, code)) => match Self::check_status(code, key) {
                Ok(()) => Ok(true),
                Err(StoreError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            },
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(map_error(e, key)),
        }
    }

    async fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        debug!(key = %key, "Getting S3 object");
        let response = self
            .bucket
            .get_object(self.object_key(key))
            .await
            .map_err(|e| map_error(e, key))?;
        Self::check_status(response.status_code(), key)?;
        Ok(response.bytes().to_vec())
    }

    async fn write(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let content_type = mime_guess::from_path(key).first_or_octet_stream().to_string();
        debug!(key = %key, content_type = %content_type, size = data.len(), "Uploading to S3");

        let response = self
            .bucket
            .put_object_with_content_type(self.object_key(key), data, &content_type)
            .await
            .map_err(|e| map_error(e, key))?;
        Self::check_status(response.status_code(), key)
    }

    async fn size(&self, key: &str) -> StoreResult<u64> {
        let (head, code) = self
            .bucket
            .head_object(self.object_key(key))
            .await
            .map_err(|e| map_error(e, key))?;
        Self::check_status(code, key)?;
        let length = head
            .content_length
            .ok_or_else(|| StoreError::Backend(format!("no content length for {key}")))?;
        u64::try_from(length).map_err(|_| StoreError::Backend(format!("bad length for {key}")))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let results = self
            .bucket
            .list(self.object_key(prefix), None)
            .await
            .map_err(|e| map_error(e, prefix))?;

        let mut keys: Vec<String> = results
            .into_iter()
            .flat_map(|result| result.contents)
            .filter_map(|object| object.key.strip_prefix(&self.prefix).map(ToString::to_string))
            .collect();
        keys.sort();

        debug!(count = keys.len(), prefix = %prefix, "Listed S3 objects");
        Ok(keys)
    }

    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        let size = self.size(from).await?;
        self.transfer
            .copy_object(&self.object_key(from), &self.object_key(to), size)
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        debug!(key = %key, "Deleting S3 object");
        match self.bucket.delete_object(self.object_key(key)).await {
            Ok(response) => match Self::check_status(response.status_code(), key) {
                Err(StoreError::NotFound(_)) => Ok(()),
                other => other,
            },
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(map_error(e, key)),
        }
    }

    async fn upload_from(&self, local: &Path, key: &str) -> StoreResult<()> {
        self.transfer.upload_file(local, &self.object_key(key)).await
    }

    fn public_url(&self, key: &str) -> String {
        let object_key = self.object_key(key);
        match &self.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket.name(),
                object_key
            ),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket.name(), object_key),
        }
    }
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("bucket", &self.bucket.name())
            .field("prefix", &self.prefix)
            .finish()
    }
}
