//! Streaming transfers for large S3 objects.
//!
//! A single S3 PUT or CopyObject is capped at 5 GiB, below the default pack
//! size limit. Files are uploaded in parts and large objects are copied with
//! ranged part copies, so no object is ever held in memory whole.

use std::path::Path;

use anyhow::{Context, Result};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{StoreError, StoreResult};
use crate::config::Config;

/// Files at or above this size are uploaded in parts of this size.
const UPLOAD_PART_SIZE: u64 = 16 * 1024 * 1024;
/// Largest object a single PUT or CopyObject request accepts.
const SINGLE_REQUEST_LIMIT: u64 = 5 * 1024 * 1024 * 1024;
const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;

/// Multipart uploader and copier for one bucket.
#[derive(Clone)]
pub struct StreamingTransfer {
    client: aws_sdk_s3::Client,
    bucket: String,
    part_size: u64,
    single_request_limit: u64,
    copy_part_size: u64,
}

impl StreamingTransfer {
    /// # Errors
    ///
    /// Returns an error if no bucket is configured.
    pub async fn new(config: &Config) -> Result<Self> {
        let bucket = config.s3_bucket.clone().context("S3_BUCKET not set")?;
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.s3_region.clone()));
        if let Some(ref endpoint) = config.s3_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(config.s3_endpoint.is_some())
            .build();
        Ok(Self::with_client(aws_sdk_s3::Client::from_conf(s3_config), bucket))
    }

    fn with_client(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self {
            client,
            bucket,
            part_size: UPLOAD_PART_SIZE,
            single_request_limit: SINGLE_REQUEST_LIMIT,
            copy_part_size: COPY_PART_SIZE,
        }
    }

    /// Upload a local file, in parts when it is large.
    ///
    /// # Errors
    ///
    /// Local read failures are [`StoreError::Io`]; request failures are
    /// classified by status.
    pub async fn upload_file(&self, local: &Path, key: &str) -> StoreResult<()> {
        let size = tokio::fs::metadata(local).await?.len();
        let content_type = mime_guess::from_path(key).first_or_octet_stream().to_string();
        debug!(key = %key, content_type = %content_type, size, "Uploading file to S3");

        if size < self.part_size {
            let body = ByteStream::from_path(local)
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .content_type(content_type)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))?;
            return Ok(());
        }

        info!(key = %key, size_mb = size / 1_024 / 1_024, "Starting multipart upload");
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Backend(format!("no upload id for {key}")))?
            .to_string();

        let parts = self.upload_parts(local, key, &upload_id).await;
        self.finish_multipart(key, &upload_id, parts).await
    }

    async fn upload_parts(&self, local: &Path, key: &str, upload_id: &str) -> StoreResult<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(local).await?;
        let mut parts = Vec::new();
        let mut part_number = 1;

        loop {
            let mut buffer = Vec::new();
            let read = (&mut file).take(self.part_size).read_to_end(&mut buffer).await?;
            if read == 0 {
                break;
            }

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))?;
            let etag = output
                .e_tag()
                .ok_or_else(|| StoreError::Backend(format!("no ETag for part {part_number} of {key}")))?;
            parts.push(CompletedPart::builder().part_number(part_number).e_tag(etag).build());
            debug!(key = %key, part_number, "Uploaded part");
            part_number += 1;
        }
        Ok(parts)
    }

    /// Copy `from` to `to` inside the bucket. `size` is the size of `from`.
    ///
    /// # Errors
    ///
    /// Request failures are classified by status.
    pub async fn copy_object(&self, from: &str, to: &str, size: u64) -> StoreResult<()> {
        let copy_source = format!("{}/{}", self.bucket, from);

        if size < self.single_request_limit {
            debug!(from = %from, to = %to, "Copying S3 object (server-side)");
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(copy_source)
                .key(to)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, from))?;
            return Ok(());
        }

        info!(from = %from, to = %to, size_mb = size / 1_024 / 1_024, "Starting multipart copy");
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(to)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, to))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Backend(format!("no upload id for {to}")))?
            .to_string();

        let parts = self.copy_parts(&copy_source, to, &upload_id, size).await;
        self.finish_multipart(to, &upload_id, parts).await
    }

    async fn copy_parts(
        &self,
        copy_source: &str,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> StoreResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        for (part_number, (first, last)) in (1..).zip(part_ranges(size, self.copy_part_size)) {
            let output = self
                .client
                .upload_part_copy()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(copy_source)
                .copy_source_range(format!("bytes={first}-{last}"))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))?;
            let etag = output
                .copy_part_result()
                .and_then(|result| result.e_tag())
                .ok_or_else(|| StoreError::Backend(format!("no ETag for part {part_number} of {key}")))?;
            parts.push(CompletedPart::builder().part_number(part_number).e_tag(etag).build());
        }
        Ok(parts)
    }

    /// Complete the upload on success, abort it otherwise.
    async fn finish_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: StoreResult<Vec<CompletedPart>>,
    ) -> StoreResult<()> {
        let parts = match parts {
            Ok(parts) => parts,
            Err(e) => {
                debug!(key = %key, upload_id = %upload_id, "Aborting multipart upload: {e}");
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        upload_id = %upload_id,
                        "Failed to abort multipart upload: {}",
                        DisplayErrorContext(&abort)
                    );
                }
                return Err(e);
            }
        };

        let count = parts.len();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        info!(key = %key, parts = count, "Multipart transfer completed");
        Ok(())
    }
}

impl std::fmt::Debug for StreamingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTransfer")
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Inclusive byte ranges covering `size` bytes in chunks of `part_size`.
fn part_ranges(size: u64, part_size: u64) -> Vec<(u64, u64)> {
    let part_size = part_size.max(1);
    (0..size)
        .step_by(usize::try_from(part_size).unwrap_or(usize::MAX))
        .map(|first| (first, (first + part_size).min(size) - 1))
        .collect()
}

fn map_sdk_error<E>(e: SdkError<E, HttpResponse>, key: &str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{key}: {}", DisplayErrorContext(&e));
    let status = match &e {
        SdkError::ServiceError(service) => service.raw().status().as_u16(),
        SdkError::ResponseError(response) => response.raw().status().as_u16(),
        SdkError::ConstructionFailure(_) => return StoreError::Backend(detail),
        // Timeouts and connection failures
        _ => return StoreError::Transient(detail),
    };
    match status {
        404 => StoreError::NotFound(key.to_string()),
        429 | 500..=599 => StoreError::Transient(detail),
        _ => StoreError::Backend(detail),
    }
}
