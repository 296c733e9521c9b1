use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use super::traits::{ResourceExtractor, ResourceId};
use super::rebase_origin;
use crate::archiver::bundle;
use crate::http::{DownloadTarget, HttpClient};

const HOSTS: [&str; 2] = ["dropbox.com", "www.dropbox.com"];

/// Dropbox share links (`?dl=0`).
#[derive(Debug)]
pub struct DropboxExtractor {
    http: HttpClient,
    content_origin: Option<Url>,
}

impl DropboxExtractor {
    #[must_use]
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            content_origin: None,
        }
    }

    /// Send downloads to another origin (scheme, host and port) instead of
    /// the link's own host.
    #[must_use]
    pub fn with_content_origin(mut self, origin: Url) -> Self {
        self.content_origin = Some(origin);
        self
    }

    fn download_url(&self, url: &Url) -> Url {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let value = if k == "dl" { "1".to_string() } else { v.into_owned() };
                (k.into_owned(), value)
            })
            .collect();

        let mut download = url.clone();
        download.query_pairs_mut().clear().extend_pairs(pairs);
        match &self.content_origin {
            Some(origin) => rebase_origin(&download, origin),
            None => download,
        }
    }
}

#[async_trait]
impl ResourceExtractor for DropboxExtractor {
    fn site_id(&self) -> &'static str {
        "dropbox"
    }

    fn recognize(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| HOSTS.contains(&host))
            && url.query_pairs().any(|(k, v)| k == "dl" && v == "0")
    }

    async fn identify(&self, url: &Url) -> Option<ResourceId> {
        let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return None;
        }
        Some(ResourceId::new(format!("dropbox_{}", segments.join("_"))))
    }

    async fn fetch(&self, url: &Url, dest: &Path) -> Result<()> {
        let download_url = self.download_url(url);
        debug!(url = %download_url, "Downloading Dropbox share");

        let file = self
            .http
            .download(download_url.as_str(), DownloadTarget::IntoDir(dest))
            .await
            .with_context(|| format!("Failed to download Dropbox share {url}"))?;

        let is_zip = file
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip {
            let archive = file.clone();
            let target = dest.to_path_buf();
            let entries = tokio::task::spawn_blocking(move || bundle::extract_zip(&archive, &target))
                .await
                .context("Extraction task panicked")??;
            tokio::fs::remove_file(&file).await?;
            info!(url = %url, entries, "Extracted Dropbox folder archive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::http::RetryPolicy;

    fn extractor() -> DropboxExtractor {
        DropboxExtractor::new(HttpClient::new(Duration::from_secs(5), RetryPolicy::new(1)).unwrap())
    }

    #[test]
    fn test_recognize_requires_dl_zero() {
        let e = extractor();
        let yes = Url::parse("https://www.dropbox.com/s/abc123/art.psd?dl=0").unwrap();
        let no_dl = Url::parse("https://www.dropbox.com/s/abc123/art.psd").unwrap();
        let direct = Url::parse("https://www.dropbox.com/s/abc123/art.psd?dl=1").unwrap();
        let other = Url::parse("https://dropbox.example.com/s/abc?dl=0").unwrap();

        assert!(e.recognize(&yes));
        assert!(!e.recognize(&no_dl));
        assert!(!e.recognize(&direct));
        assert!(!e.recognize(&other));
    }

    #[tokio::test]
    async fn test_identify_joins_path_segments() {
        let e = extractor();
        let url = Url::parse("https://www.dropbox.com/sh/xyz/AAB-cd/?dl=0").unwrap();
        assert_eq!(
            e.identify(&url).await.unwrap().as_str(),
            "dropbox_sh_xyz_AAB-cd"
        );

        let same = Url::parse("https://dropbox.com/sh/xyz/AAB-cd?dl=0&lang=ja").unwrap();
        assert_eq!(e.identify(&same).await, e.identify(&url).await);
    }

    #[test]
    fn test_download_url_switches_to_dl_one() {
        let e = extractor();
        let url = Url::parse("https://www.dropbox.com/s/abc/file.png?rlkey=k&dl=0").unwrap();
        assert_eq!(
            e.download_url(&url).as_str(),
            "https://www.dropbox.com/s/abc/file.png?rlkey=k&dl=1"
        );

        let rebased = extractor()
            .with_content_origin(Url::parse("http://127.0.0.1:9000").unwrap())
            .download_url(&url);
        assert_eq!(rebased.as_str(), "http://127.0.0.1:9000/s/abc/file.png?rlkey=k&dl=1");
    }
}
