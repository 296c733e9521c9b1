use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::REFERER;
use scraper::{Html, Selector};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use super::traits::{ResourceExtractor, ResourceId};
use crate::http::{safe_file_name, DownloadTarget, HttpClient};

static CLIENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"apiClientId:\s*"([a-z\d]+)""#).unwrap());

static SCRIPT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script[src]").unwrap());

const HOSTS: [&str; 2] = ["imgur.com", "www.imgur.com"];

#[derive(Debug, Deserialize)]
struct Album {
    #[serde(default)]
    media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct Media {
    url: Option<String>,
    name: Option<String>,
    mime_type: Option<String>,
}

/// Imgur albums (`imgur.com/a/{id}`).
#[derive(Debug)]
pub struct ImgurExtractor {
    http: HttpClient,
    web_origin: Url,
    api_origin: Url,
    client_id: OnceCell<String>,
}

impl ImgurExtractor {
    /// # Panics
    ///
    /// Never; the default origins are constant and valid.
    #[must_use]
    pub fn new(http: HttpClient) -> Self {
        Self::with_origins(
            http,
            Url::parse("https://imgur.com/").expect("constant URL"),
            Url::parse("https://api.imgur.com/").expect("constant URL"),
        )
    }

    /// Use other origins for the web page and the JSON API.
    #[must_use]
    pub fn with_origins(http: HttpClient, web_origin: Url, api_origin: Url) -> Self {
        Self {
            http,
            web_origin,
            api_origin,
            client_id: OnceCell::new(),
        }
    }

    fn album_id(url: &Url) -> Option<&str> {
        let mut segments = url.path_segments()?;
        if segments.next()? != "a" {
            return None;
        }
        segments.next().filter(|id| !id.is_empty())
    }

    /// Web client id, discovered once from the site's main script.
    async fn client_id(&self) -> Result<&str> {
        let id = self
            .client_id
            .get_or_try_init(|| async {
                let home = self.http.get_text(self.web_origin.as_str()).await?;
                let script = find_main_script(&home, &self.web_origin)
                    .context("No main script referenced on the Imgur home page")?;
                let source = self.http.get_text(script.as_str()).await?;
                let id = parse_client_id(&source)
                    .context("No API client id found in the Imgur main script")?;
                debug!(client_id = %id, "Discovered Imgur client id");
                Ok::<_, anyhow::Error>(id)
            })
            .await?;
        Ok(id.as_str())
    }

    async fn list_media(&self, album_id: &str) -> Result<Vec<Media>> {
        let client_id = self.client_id().await?;
        let mut endpoint = self
            .api_origin
            .join(&format!("post/v1/albums/{album_id}"))
            .context("Invalid Imgur album id")?;
        endpoint
            .query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("include", "media,adconfig,account");

        let referer = self.web_origin.as_str();
        let response = self
            .http
            .send_with_retry(|client| client.get(endpoint.clone()).header(REFERER, referer))
            .await?
            .error_for_status()
            .with_context(|| format!("Imgur album {album_id} lookup failed"))?;
        let album: Album = response.json().await.context("Invalid Imgur album JSON")?;
        Ok(album.media)
    }
}

/// Locate the `main` bundle script on the home page. The last match wins.
fn find_main_script(html: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(html);
    document
        .select(&SCRIPT_SELECTOR)
        .filter_map(|script| script.value().attr("src"))
        .filter(|src| src.contains("main"))
        .last()
        .and_then(|src| base.join(src).ok())
}

fn parse_client_id(script: &str) -> Option<String> {
    CLIENT_ID_RE
        .captures(script)
        .map(|caps| caps[1].to_string())
}

/// File name for a media item, adding an extension from its MIME type when
/// the name has none.
fn media_file_name(media: &Media) -> Option<String> {
    let url = media.url.as_deref()?;
    let name = media
        .name
        .as_deref()
        .and_then(safe_file_name)
        .or_else(|| safe_file_name(url.split(['?', '#']).next().unwrap_or(url)))?;

    if Path::new(&name).extension().is_some() {
        return Some(name);
    }
    let ext = media
        .mime_type
        .as_deref()
        .and_then(mime_guess::get_mime_extensions_str)
        .and_then(|exts| exts.first());
    Some(match ext {
        Some(ext) => format!("{name}.{ext}"),
        None => name,
    })
}

#[async_trait]
impl ResourceExtractor for ImgurExtractor {
    fn site_id(&self) -> &'static str {
        "imgur"
    }

    fn recognize(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| HOSTS.contains(&host))
            && url.path_segments().and_then(|mut s| s.next()) == Some("a")
    }

    async fn identify(&self, url: &Url) -> Option<ResourceId> {
        Self::album_id(url).map(|id| ResourceId::new(format!("imgur_{id}")))
    }

    async fn fetch(&self, url: &Url, dest: &Path) -> Result<()> {
        let album_id = Self::album_id(url).context("Imgur URL without album id")?;
        let media = self.list_media(album_id).await?;
        debug!(album = %album_id, count = media.len(), "Listed Imgur album");

        let mut downloaded = 0;
        for item in &media {
            let (Some(media_url), Some(name)) = (item.url.as_deref(), media_file_name(item)) else {
                continue;
            };
            self.http
                .download(media_url, DownloadTarget::File(&dest.join(&name)))
                .await
                .with_context(|| format!("Failed to download Imgur media {media_url}"))?;
            downloaded += 1;
        }

        info!(album = %album_id, files = downloaded, "Fetched Imgur album");
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

    fn http() -> HttpClient {
        HttpClient::new(Duration::from_secs(5), RetryPolicy::new(1)).unwrap()
    }

    #[tokio::test]
    async fn test_recognize_and_identify() {
        let e = ImgurExtractor::new(http());
        let album = Url::parse("https://imgur.com/a/AbC12").unwrap();
        let www = Url::parse("https://www.imgur.com/a/AbC12?ref=share").unwrap();
        let gallery = Url::parse("https://imgur.com/gallery/AbC12").unwrap();
        let bare = Url::parse("https://imgur.com/a/").unwrap();

        assert!(e.recognize(&album));
        assert!(e.recognize(&www));
        assert!(!e.recognize(&gallery));
        assert_eq!(e.identify(&album).await.unwrap().as_str(), "imgur_AbC12");
        assert_eq!(e.identify(&www).await, e.identify(&album).await);
        assert!(e.recognize(&bare));
        assert!(e.identify(&bare).await.is_none());
    }

    #[test]
    fn test_parse_client_id_and_script() {
        assert_eq!(
            parse_client_id(r#"x={apiClientId: "546c25a59c58ad7",other:1}"#).as_deref(),
            Some("546c25a59c58ad7")
        );
        assert!(parse_client_id("nothing here").is_none());

        let base = Url::parse("https://imgur.com/").unwrap();
        let html = r#"<html><head>
            <script src="/js/vendor.1.js"></script>
            <script src="https://s.imgur.com/desktop-assets/js/main.abc123.js"></script>
        </head></html>"#;
        assert_eq!(
            find_main_script(html, &base).unwrap().as_str(),
            "https://s.imgur.com/desktop-assets/js/main.abc123.js"
        );
    }

    #[test]
    fn test_media_file_name_adds_extension_from_mime() {
        let media = Media {
            url: Some("https://i.imgur.com/xyz.png".to_string()),
            name: Some("sketch".to_string()),
            mime_type: Some("image/png".to_string()),
        };
        assert_eq!(media_file_name(&media).as_deref(), Some("sketch.png"));

        let named = Media {
            url: Some("https://i.imgur.com/xyz.jpeg".to_string()),
            name: Some("final.jpeg".to_string()),
            mime_type: Some("image/jpeg".to_string()),
        };
        assert_eq!(media_file_name(&named).as_deref(), Some("final.jpeg"));

        let unnamed = Media {
            url: Some("https://i.imgur.com/xyz.gif".to_string()),
            name: Some(String::new()),
            mime_type: None,
        };
        assert_eq!(media_file_name(&unnamed).as_deref(), Some("xyz.gif"));
    }

    #[tokio::test]
    async fn test_fetch_album() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><script src="/js/main.1.js"></script></html>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/js/main.1.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{apiClientId:"abc123"}"#))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/post/v1/albums/AbC12"))
            .and(query_param("client_id", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "media": [
                    {"url": format!("{}/i/one.png", server.uri()), "name": "one", "mime_type": "image/png"},
                    {"name": "no url"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/i/one.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png".to_vec()))
            .mount(&server)
            .await;

        let origin = Url::parse(&format!("{}/", server.uri())).unwrap();
        let e = ImgurExtractor::with_origins(http(), origin.clone(), origin);
        let dest = TempDir::new().unwrap();
        let url = Url::parse("https://imgur.com/a/AbC12").unwrap();

        e.fetch(&url, dest.path()).await.unwrap();
        assert_eq!(std::fs::read(dest.path().join("one.png")).unwrap(), b"png");

        // Client id is cached for later albums.
        e.fetch(&url, dest.path()).await.unwrap();
    }
}
