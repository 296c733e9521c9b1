use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use super::traits::{ResourceExtractor, ResourceId};
use crate::archiver::Throttler;
use crate::http::{safe_file_name, save_response, DownloadTarget, HttpClient};

const HOST: &str = "drive.google.com";

/// Interstitial pages (virus-scan warning) followed before giving up.
const MAX_CONFIRMATION_HOPS: usize = 3;

static ENTRY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.flip-entry").unwrap());
static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".flip-entry-title").unwrap());
static LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static FORM_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("form#download-form").unwrap());
static HIDDEN_INPUT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input[type=hidden][name]").unwrap());
static DOWNLOAD_LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a#uc-download-link[href]").unwrap());

/// What a Drive URL points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveLink {
    File(String),
    Folder(String),
}

impl DriveLink {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::File(id) | Self::Folder(id) => id,
        }
    }
}

/// Parse a Drive link.
///
/// Understands `/file/d/{id}`, `/drive/folders/{id}` (with or without a
/// `/u/{n}` account segment) and `?id={id}` forms such as `/open` and `/uc`.
/// Other query parameters are ignored.
#[must_use]
pub fn parse_drive_link(url: &Url) -> Option<DriveLink> {
    if url.host_str() != Some(HOST) {
        return None;
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    if let ["file", "d", id, ..] = segments.as_slice() {
        return Some(DriveLink::File((*id).to_string()));
    }
    if let Some(pos) = segments.iter().position(|s| *s == "folders") {
        return segments
            .get(pos + 1)
            .map(|id| DriveLink::Folder((*id).to_string()));
    }
    url.query_pairs()
        .find(|(k, v)| k == "id" && !v.is_empty())
        .map(|(_, v)| DriveLink::File(v.into_owned()))
}

/// One item of an embedded folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
}

/// Parse the entries of an `embeddedfolderview` page.
#[must_use]
pub fn parse_folder_entries(html: &str) -> Vec<FolderEntry> {
    let document = Html::parse_document(html);
    document
        .select(&ENTRY_SELECTOR)
        .filter_map(|entry| {
            let id = entry.value().attr("id")?.strip_prefix("entry-")?.to_string();
            let name = entry
                .select(&TITLE_SELECTOR)
                .next()
                .map(|title| title.text().collect::<String>().trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| id.clone());
            let is_folder = entry
                .select(&LINK_SELECTOR)
                .next()
                .and_then(|link| link.value().attr("href"))
                .is_some_and(|href| href.contains("/folders/"));
            Some(FolderEntry {
                id,
                name,
                is_folder,
            })
        })
        .collect()
}

/// Find the real download URL on a "can't scan for viruses" interstitial.
#[must_use]
pub fn parse_confirmation_url(html: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(html);

    if let Some(form) = document.select(&FORM_SELECTOR).next() {
        let action = form.value().attr("action")?;
        let mut url = base.join(action).ok()?;
        {
            let mut query = url.query_pairs_mut();
            for input in form.select(&HIDDEN_INPUT_SELECTOR) {
                if let Some(name) = input.value().attr("name") {
                    query.append_pair(name, input.value().attr("value").unwrap_or_default());
                }
            }
        }
        return Some(url);
    }

    document
        .select(&DOWNLOAD_LINK_SELECTOR)
        .next()
        .and_then(|link| link.value().attr("href"))
        .and_then(|href| base.join(href).ok())
}

/// Google Drive files and folders.
#[derive(Debug)]
pub struct GoogleDriveExtractor {
    http: HttpClient,
    throttler: Throttler,
    origin: Url,
}

impl GoogleDriveExtractor {
    /// # Panics
    ///
    /// Never; the default origin is constant and valid.
    #[must_use]
    pub fn new(http: HttpClient, throttler: Throttler) -> Self {
        Self::with_origin(
            http,
            throttler,
            Url::parse("https://drive.google.com/").expect("constant URL"),
        )
    }

    /// Send Drive requests to another origin.
    #[must_use]
    pub fn with_origin(http: HttpClient, throttler: Throttler, origin: Url) -> Self {
        Self {
            http,
            throttler,
            origin,
        }
    }

    fn endpoint(&self, path: &str, id: &str) -> Result<Url> {
        let mut url = self.origin.join(path).context("Invalid Drive endpoint")?;
        url.query_pairs_mut().append_pair("id", id);
        Ok(url)
    }

    async fn download_file(&self, id: &str, target: DownloadTarget<'_>) -> Result<PathBuf> {
        self.throttler.wait().await;

        let mut url = self.origin.join("uc").context("Invalid Drive endpoint")?;
        url.query_pairs_mut()
            .append_pair("export", "download")
            .append_pair("id", id);

        for _ in 0..MAX_CONFIRMATION_HOPS {
            let response = self.http.get(url.as_str()).await?;
            if response.headers().contains_key(CONTENT_DISPOSITION) {
                return save_response(response, target).await;
            }

            let is_html = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/html"));
            if !is_html {
                bail!("Unexpected response for Drive file {id}");
            }

            let base = response.url().clone();
            let html = response.text().await?;
            url = parse_confirmation_url(&html, &base).with_context(|| {
                format!("Drive file {id} cannot be downloaded (private, deleted or over quota)")
            })?;
            debug!(id = %id, url = %url, "Following Drive download confirmation");
        }

        bail!("Too many confirmation pages for Drive file {id}")
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<FolderEntry>> {
        self.throttler.wait().await;
        let url = self.endpoint("embeddedfolderview", folder_id)?;
        let html = self.http.get_text(url.as_str()).await?;
        Ok(parse_folder_entries(&html))
    }

    /// Walk a folder tree depth-first, mirroring it under `dest`.
    async fn walk_folder(&self, root_id: &str, dest: &Path) -> Result<usize> {
        let mut downloaded = 0;
        let mut visited = HashSet::new();
        let mut stack = vec![(root_id.to_string(), PathBuf::new())];

        while let Some((folder_id, relative)) = stack.pop() {
            if !visited.insert(folder_id.clone()) {
                continue;
            }
            for entry in self.list_folder(&folder_id).await? {
                let name = safe_file_name(&entry.name).unwrap_or_else(|| entry.id.clone());
                if entry.is_folder {
                    stack.push((entry.id, relative.join(name)));
                    continue;
                }
                let target = dest.join(&relative).join(&name);
                self.download_file(&entry.id, DownloadTarget::File(&target))
                    .await?;
                downloaded += 1;
            }
        }

        Ok(downloaded)
    }
}

#[async_trait]
impl ResourceExtractor for GoogleDriveExtractor {
    fn site_id(&self) -> &'static str {
        "googledrive"
    }

    fn recognize(&self, url: &Url) -> bool {
        url.host_str() == Some(HOST)
    }

    async fn identify(&self, url: &Url) -> Option<ResourceId> {
        parse_drive_link(url).map(|link| ResourceId::new(format!("googledrive_{}", link.id())))
    }

    async fn fetch(&self, url: &Url, dest: &Path) -> Result<()> {
        match parse_drive_link(url).context("Not a Drive file or folder link")? {
            DriveLink::File(id) => {
                let path = self.download_file(&id, DownloadTarget::IntoDir(dest)).await?;
                info!(url = %url, path = %path.display(), "Fetched Drive file");
            }
            DriveLink::Folder(id) => match self.walk_folder(&id, dest).await {
                Ok(files) => info!(url = %url, files, "Fetched Drive folder"),
                Err(e) => {
                    // Whatever was downloaded before the failure is kept.
                    warn!(url = %url, "Stopped walking Drive folder: {e:#}");
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::http::RetryPolicy;

    fn extractor(origin: &str) -> GoogleDriveExtractor {
        GoogleDriveExtractor::with_origin(
            HttpClient::new(Duration::from_secs(5), RetryPolicy::new(1)).unwrap(),
            Throttler::new(Duration::ZERO, 0.0),
            Url::parse(origin).unwrap(),
        )
    }

    fn link(s: &str) -> Option<DriveLink> {
        parse_drive_link(&Url::parse(s).unwrap())
    }

    #[test]
    fn test_parse_drive_link() {
        assert_eq!(
            link("https://drive.google.com/file/d/1AbC/view?usp=sharing"),
            Some(DriveLink::File("1AbC".to_string()))
        );
        assert_eq!(
            link("https://drive.google.com/drive/folders/0Fold?usp=drive_link"),
            Some(DriveLink::Folder("0Fold".to_string()))
        );
        assert_eq!(
            link("https://drive.google.com/drive/u/1/folders/0Fold"),
            Some(DriveLink::Folder("0Fold".to_string()))
        );
        assert_eq!(
            link("https://drive.google.com/open?id=1Xyz"),
            Some(DriveLink::File("1Xyz".to_string()))
        );
        assert_eq!(
            link("https://drive.google.com/uc?export=download&id=1Xyz"),
            Some(DriveLink::File("1Xyz".to_string()))
        );
        assert_eq!(link("https://drive.google.com/drive/my-drive"), None);
        assert_eq!(link("https://docs.google.com/file/d/1AbC"), None);
    }

    #[tokio::test]
    async fn test_identify_is_stable_across_link_forms() {
        let e = extractor("https://drive.google.com/");
        let a = Url::parse("https://drive.google.com/file/d/1AbC/view?usp=sharing").unwrap();
        let b = Url::parse("https://drive.google.com/open?id=1AbC").unwrap();
        assert_eq!(e.identify(&a).await.unwrap().as_str(), "googledrive_1AbC");
        assert_eq!(e.identify(&a).await, e.identify(&b).await);

        let unresolvable = Url::parse("https://drive.google.com/drive/my-drive").unwrap();
        assert!(e.recognize(&unresolvable));
        assert!(e.identify(&unresolvable).await.is_none());
    }

    #[test]
    fn test_parse_folder_entries() {
        let html = r#"<div class="flip-entries">
          <div class="flip-entry" id="entry-F1"><div class="flip-entry-info">
            <a href="https://drive.google.com/drive/folders/F1"><div class="flip-entry-title">Sketches</div></a>
          </div></div>
          <div class="flip-entry" id="entry-X9"><div class="flip-entry-info">
            <a href="https://drive.google.com/file/d/X9/view?usp=drive_web"><div class="flip-entry-title">final.png</div></a>
          </div></div>
        </div>"#;

        assert_eq!(
            parse_folder_entries(html),
            vec![
                FolderEntry {
                    id: "F1".to_string(),
                    name: "Sketches".to_string(),
                    is_folder: true
                },
                FolderEntry {
                    id: "X9".to_string(),
                    name: "final.png".to_string(),
                    is_folder: false
                },
            ]
        );
    }

    #[test]
    fn test_parse_confirmation_form() {
        let base = Url::parse("https://drive.google.com/uc?export=download&id=1AbC").unwrap();
        let html = r#"<form id="download-form" action="https://drive.usercontent.google.com/download" method="get">
            <input type="hidden" name="id" value="1AbC">
            <input type="hidden" name="export" value="download">
            <input type="hidden" name="confirm" value="t">
            <input type="submit" value="Download anyway">
        </form>"#;

        assert_eq!(
            parse_confirmation_url(html, &base).unwrap().as_str(),
            "https://drive.usercontent.google.com/download?id=1AbC&export=download&confirm=t"
        );
        assert!(parse_confirmation_url("<p>Access denied</p>", &base).is_none());
    }

    #[tokio::test]
    async fn test_folder_walk_keeps_partial_results() {
        let server = MockServer::start().await;
        let listing = r#"
          <div class="flip-entry" id="entry-ok"><a href="/file/d/ok/view"><div class="flip-entry-title">ok.png</div></a></div>
          <div class="flip-entry" id="entry-gone"><a href="/file/d/gone/view"><div class="flip-entry-title">gone.png</div></a></div>"#;
        Mock::given(method("GET"))
            .and(path("/embeddedfolderview"))
            .and(query_param("id", "root"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/uc"))
            .and(query_param("id", "ok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Disposition", r#"attachment; filename="ok.png""#)
                    .set_body_bytes(b"ok".to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/uc"))
            .and(query_param("id", "gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let e = extractor(&format!("{}/", server.uri()));
        let dest = TempDir::new().unwrap();
        let url = Url::parse("https://drive.google.com/drive/folders/root").unwrap();

        e.fetch(&url, dest.path()).await.unwrap();
        assert_eq!(std::fs::read(dest.path().join("ok.png")).unwrap(), b"ok");
        assert!(!dest.path().join("gone.png").exists());
    }
}
