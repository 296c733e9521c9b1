//! Shared HTTP client with a bounded retry policy and file downloads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::constants::ARCHIVAL_USER_AGENT;

/// How often and how patiently a request is retried.
///
/// Server errors and connection failures back off exponentially from
/// `base_delay`, capped at `max_delay`. A 429 is retried only when the server
/// says when to come back (`Retry-After`); otherwise the response is handed to
/// the caller, which may know a site-specific way to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Where a download should land.
#[derive(Debug, Clone, Copy)]
pub enum DownloadTarget<'a> {
    /// Exactly this file path.
    File(&'a Path),
    /// Inside this directory, named from `Content-Disposition` or the URL.
    IntoDir(&'a Path),
}

/// `reqwest` client shared by the post source and the extractors.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(ARCHIVAL_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, retry })
    }

    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.http_timeout, RetryPolicy::new(config.http_max_retries))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Send the request built by `build`, retrying per the [`RetryPolicy`].
    ///
    /// The closure is called once per attempt. The last response is returned
    /// as-is even when its status is an error, so callers decide how to treat it.
    ///
    /// # Errors
    ///
    /// Returns an error if every attempt fails at the transport level, or on a
    /// non-retryable transport error.
    pub async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let last = attempt >= self.retry.max_attempts;

            match build(&self.client).send().await {
                Ok(response) => {
                    let Some(delay) = self.retry_delay(&response, attempt) else {
                        return Ok(response);
                    };
                    if last {
                        return Ok(response);
                    }
                    warn!(
                        url = %response.url(),
                        status = %response.status(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if !last && (e.is_connect() || e.is_timeout()) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis(), "Request failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e).context("HTTP request failed"),
            }
        }
    }

    fn retry_delay(&self, response: &Response, attempt: u32) -> Option<Duration> {
        let status = response.status();
        if status.is_server_error() {
            return Some(self.retry.delay_for(attempt));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return retry_after(response.headers()).map(|delay| delay.min(self.retry.max_delay));
        }
        None
    }

    /// GET a URL and fail on a non-success status.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an error status.
    pub async fn get(&self, url: &str) -> Result<Response> {
        debug!(url = %url, "GET");
        let response = self.send_with_retry(|client| client.get(url)).await?;
        response
            .error_for_status()
            .with_context(|| format!("GET {url} failed"))
    }

    /// # Errors
    ///
    /// Returns an error on transport failure, an error status or an unreadable body.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        self.get(url)
            .await?
            .text()
            .await
            .with_context(|| format!("Failed to read body of {url}"))
    }

    /// # Errors
    ///
    /// Returns an error on transport failure, an error status or invalid JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.get(url)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to decode JSON from {url}"))
    }

    /// Download `url` to `target` and return the written path.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, no file name can be determined
    /// or the received size does not match `Content-Length`.
    pub async fn download(&self, url: &str, target: DownloadTarget<'_>) -> Result<PathBuf> {
        let response = self.get(url).await?;
        save_response(response, target).await
    }
}

/// Stream a response body to disk.
///
/// A file whose size differs from the announced `Content-Length` is removed.
///
/// # Errors
///
/// Returns an error on I/O failure, an unnamed download or a size mismatch.
pub async fn save_response(mut response: Response, target: DownloadTarget<'_>) -> Result<PathBuf> {
    let path = match target {
        DownloadTarget::File(path) => path.to_path_buf(),
        DownloadTarget::IntoDir(dir) => {
            let name = response
                .headers()
                .get(CONTENT_DISPOSITION)
                .and_then(|value| value.to_str().ok())
                .and_then(filename_from_disposition)
                .or_else(|| filename_from_url(response.url()))
                .with_context(|| format!("Cannot determine a file name for {}", response.url()))?;
            dir.join(name)
        }
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let expected = response.content_length();
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Failed to read body of {}", response.url()))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if let Some(expected) = expected {
        if expected != written {
            let _ = tokio::fs::remove_file(&path).await;
            bail!(
                "Downloaded file is not of expected size, {expected} expected but {written} found"
            );
        }
    }

    debug!(path = %path.display(), size = written, "Download complete");
    Ok(path)
}

/// Parse `Retry-After` given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Extract the file name from a `Content-Disposition` header value.
///
/// `filename*` (RFC 5987) wins over `filename`. Only the base name is kept.
#[must_use]
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let raw = raw.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded-name
                let encoded = raw.rsplit('\'').next().unwrap_or(raw);
                if let Some(name) = urlencoding::decode(encoded)
                    .ok()
                    .and_then(|decoded| safe_file_name(&decoded))
                {
                    return Some(name);
                }
            }
            "filename" => plain = safe_file_name(raw),
            _ => {}
        }
    }
    plain
}

fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    safe_file_name(&decoded)
}

/// Reduce an untrusted name to a plain file name, or `None` if nothing is left.
#[must_use]
pub fn safe_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client(max_attempts: u32) -> HttpClient {
        HttpClient::new(
            Duration::from_secs(5),
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_delay_for_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn test_filename_from_disposition() {
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="art pack.zip""#).as_deref(),
            Some("art pack.zip")
        );
        assert_eq!(
            filename_from_disposition(
                "attachment; filename=\"fallback.png\"; filename*=UTF-8''%E7%B5%B5.png"
            )
            .as_deref(),
            Some("絵.png")
        );
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="../../etc/passwd""#).as_deref(),
            Some("passwd")
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = fast_client(5);
        let body = client
            .get_text(&format!("{}/flaky", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = fast_client(3);
        assert!(client.get(&format!("{}/down", server.uri())).await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_without_retry_after_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let response = client
            .send_with_retry(|c| c.get(format!("{}/limited", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_download_into_dir_uses_disposition_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/s/abc/file"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Disposition", r#"attachment; filename="sketch.png""#)
                    .set_body_bytes(b"png-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = fast_client(1);
        let written = client
            .download(
                &format!("{}/s/abc/file", server.uri()),
                DownloadTarget::IntoDir(dir.path()),
            )
            .await
            .unwrap();

        assert_eq!(written, dir.path().join("sketch.png"));
        assert_eq!(std::fs::read(written).unwrap(), b"png-bytes");
    }
}
