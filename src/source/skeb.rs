use std::sync::{LazyLock, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, COOKIE, REFERER, SET_COOKIE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{PostReference, PostSource, PostStream};
use crate::config::Config;
use crate::http::HttpClient;

/// Rate-limit challenges solved for one request before giving up.
const MAX_CHALLENGE_ATTEMPTS: usize = 5;

static REQUEST_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"document\.cookie\s*=\s*"request_key=(?P<key>[^;"]+);"#).unwrap()
});

/// Order of the user directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UserSort {
    #[default]
    Popularity,
    Date,
    #[value(name = "request_masters")]
    RequestMasters,
    #[value(name = "first_requesters")]
    FirstRequesters,
}

impl UserSort {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Popularity => "popularity",
            Self::Date => "date",
            Self::RequestMasters => "request_masters",
            Self::FirstRequesters => "first_requesters",
        }
    }
}

/// Side of a commission a user's works are listed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WorkRole {
    #[default]
    Client,
    Creator,
}

impl WorkRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Creator => "creator",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkItem {
    path: String,
}

#[derive(Debug, Deserialize)]
struct UserItem {
    screen_name: String,
}

/// Body fields of a single post.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostDetail {
    #[serde(default)]
    pub source_body: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl PostDetail {
    /// Text searched for links: the request text, then the creator's reply.
    #[must_use]
    pub fn text(&self) -> String {
        format!(
            "{}\n{}",
            self.source_body.as_deref().unwrap_or_default(),
            self.body.as_deref().unwrap_or_default()
        )
    }
}

/// Client for the commissioning site's JSON API.
#[derive(Debug)]
pub struct SkebClient {
    http: HttpClient,
    base: Url,
    page_size: usize,
    request_key: Mutex<Option<String>>,
}

impl SkebClient {
    /// # Errors
    ///
    /// Returns an error if `base_url` is not a valid URL.
    pub fn new(http: HttpClient, base_url: &str, page_size: usize) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("Invalid post source URL: {base_url}"))?;
        Ok(Self {
            http,
            base,
            page_size: page_size.max(1),
            request_key: Mutex::new(None),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the configured URL is invalid.
    pub fn from_config(config: &Config, http: HttpClient) -> Result<Self> {
        Self::new(http, &config.post_source_url, config.post_page_size)
    }

    fn request_key(&self) -> Option<String> {
        self.request_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_request_key(&self, key: String) {
        *self.request_key.lock().unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    /// GET a JSON endpoint, solving the `request_key` challenge on HTTP 429.
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self
            .base
            .join(path)
            .with_context(|| format!("Invalid API path: {path}"))?;
        let referer = self.base.as_str();

        for attempt in 1..=MAX_CHALLENGE_ATTEMPTS {
            let key = self.request_key();
            let response = self
                .http
                .send_with_retry(|client| {
                    let request = client
                        .get(url.clone())
                        .query(query)
                        .header(REFERER, referer)
                        .header(AUTHORIZATION, "Bearer null")
                        .header(ACCEPT, "application/json, text/plain, */*");
                    match &key {
                        Some(key) => request.header(COOKIE, format!("request_key={key}")),
                        None => request,
                    }
                })
                .await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                let response = response
                    .error_for_status()
                    .with_context(|| format!("GET {url} failed"))?;
                return response
                    .json()
                    .await
                    .with_context(|| format!("Invalid JSON from {url}"));
            }

            let new_key = match request_key_from_headers(response.headers()) {
                Some(key) => Some(key),
                None => parse_request_key(&response.text().await.unwrap_or_default()),
            };
            let Some(new_key) = new_key else {
                bail!("Rate limited by {url} without a request key challenge");
            };
            debug!(url = %url, attempt, "Solved request key challenge");
            self.set_request_key(new_key);
        }

        bail!("Still rate limited by {url} after {MAX_CHALLENGE_ATTEMPTS} challenge attempts")
    }

    fn art_pages(&self) -> impl Stream<Item = Result<PostReference>> + Send + '_ {
        try_stream! {
            let mut offset = 0;
            loop {
                let query = [
                    ("sort", "date".to_string()),
                    ("genre", "art".to_string()),
                    ("offset", offset.to_string()),
                    ("limit", self.page_size.to_string()),
                ];
                let page: Vec<WorkItem> = self.get_json("/api/works", &query).await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                for item in page {
                    if let Some(post) = parse_item(&item) {
                        yield post;
                    }
                }
            }
        }
    }

    fn user_pages(&self, sort: UserSort, role: WorkRole) -> impl Stream<Item = Result<PostReference>> + Send + '_ {
        try_stream! {
            let mut offset = 0;
            loop {
                let query = [
                    ("sort", sort.as_str().to_string()),
                    ("offset", offset.to_string()),
                    ("limit", self.page_size.to_string()),
                ];
                let users: Vec<UserItem> = self.get_json("/api/users", &query).await?;
                if users.is_empty() {
                    break;
                }
                offset += users.len();

                for user in users {
                    let path = format!("/api/users/{}/works", urlencoding::encode(&user.screen_name));
                    let mut works_offset = 0;
                    loop {
                        let query = [
                            ("role", role.as_str().to_string()),
                            ("sort", "date".to_string()),
                            ("offset", works_offset.to_string()),
                        ];
                        let works: Vec<WorkItem> = self.get_json(&path, &query).await?;
                        if works.is_empty() {
                            break;
                        }
                        works_offset += works.len();
                        for item in works {
                            if let Some(post) = parse_item(&item) {
                                yield post;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Newest art posts, newest first.
    pub fn art_posts(&self) -> PostStream<'_> {
        Box::pin(self.art_pages())
    }

    /// Posts of every user in the directory ordered by `sort`, for users
    /// taking part as `role`.
    pub fn users_posts(&self, sort: UserSort, role: WorkRole) -> PostStream<'_> {
        Box::pin(self.user_pages(sort, role))
    }

    /// # Errors
    ///
    /// Returns an error if the post cannot be fetched.
    pub async fn post_detail(&self, post: &PostReference) -> Result<PostDetail> {
        let path = format!(
            "/api/users/{}/works/{}",
            urlencoding::encode(&post.username),
            post.work_id
        );
        self.get_json(&path, &[]).await
    }
}

#[async_trait]
impl PostSource for SkebClient {
    async fn post_text(&self, post: &PostReference) -> Result<String> {
        Ok(self.post_detail(post).await?.text())
    }
}

fn parse_item(item: &WorkItem) -> Option<PostReference> {
    match PostReference::parse_path(&item.path) {
        Ok(post) => Some(post),
        Err(e) => {
            warn!(path = %item.path, "Skipping listing entry: {e:#}");
            None
        }
    }
}

fn request_key_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            cookie
                .split(';')
                .next()?
                .trim()
                .strip_prefix("request_key=")
                .filter(|key| !key.is_empty())
                .map(ToString::to_string)
        })
}

fn parse_request_key(body: &str) -> Option<String> {
    REQUEST_KEY_RE
        .captures(body)
        .map(|caps| caps["key"].to_string())
}
