//! Sources of commission posts.

mod link_extractor;
mod skeb;

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use regex::Regex;

pub use link_extractor::extract_urls;
pub use skeb::{SkebClient, UserSort, WorkRole};

static POST_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/?@?(?P<username>.+?)/works/(?P<work_id>\d+)/?$").unwrap());

/// A single post on the commissioning site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PostReference {
    pub username: String,
    pub work_id: u64,
}

impl PostReference {
    pub fn new(username: impl Into<String>, work_id: u64) -> Self {
        Self {
            username: username.into(),
            work_id,
        }
    }

    /// Parse a post path such as `/@alice/works/12`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a post path.
    pub fn parse_path(path: &str) -> Result<Self> {
        let caps = POST_PATH_RE
            .captures(path)
            .with_context(|| format!("Not a post path: {path:?}"))?;
        let work_id = caps["work_id"]
            .parse()
            .with_context(|| format!("Work id out of range in {path:?}"))?;
        Ok(Self::new(&caps["username"], work_id))
    }

    /// Prefix for bundle entry names of files found in this post.
    #[must_use]
    pub fn bundle_prefix(&self) -> String {
        format!("{}_{}_", self.username, self.work_id)
    }
}

impl fmt::Display for PostReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}/works/{}", self.username, self.work_id)
    }
}

/// A lazily paginated listing of posts.
///
/// An `Err` item means the listing itself failed and no further items follow.
pub type PostStream<'a> = BoxStream<'a, Result<PostReference>>;

/// Access to post bodies.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Free text of a post in which resource links are searched.
    ///
    /// # Errors
    ///
    /// Returns an error if the post cannot be fetched.
    async fn post_text(&self, post: &PostReference) -> Result<String>;
}
