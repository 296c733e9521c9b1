use std::fmt;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

/// Stable dedup key of a downloadable resource, e.g. `imgur_AbC12`.
///
/// Two URLs pointing at the same underlying file or folder map to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Site-specific support for one family of file-host links.
#[async_trait]
pub trait ResourceExtractor: Send + Sync + fmt::Debug {
    /// Short name used in logs and resource ids.
    fn site_id(&self) -> &'static str;

    /// Whether this extractor owns the URL. Pure; no network access.
    fn recognize(&self, url: &Url) -> bool;

    /// Derive the resource id of a recognized URL.
    ///
    /// `None` means recognized but not resolvable; the URL is skipped.
    async fn identify(&self, url: &Url) -> Option<ResourceId>;

    /// Download every file of the resource into `dest`.
    ///
    /// Sub-directories may be created; their names become part of the bundle
    /// entry names.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be downloaded.
    async fn fetch(&self, url: &Url, dest: &Path) -> Result<()>;
}
