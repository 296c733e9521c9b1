//! Resource extractors for the supported file hosts.

mod dropbox;
mod google_drive;
mod imgur;
mod registry;
mod traits;

use std::time::Duration;

use url::Url;

use crate::archiver::Throttler;
use crate::http::HttpClient;

pub use dropbox::DropboxExtractor;
pub use google_drive::{parse_drive_link, DriveLink, GoogleDriveExtractor};
pub use imgur::ImgurExtractor;
pub use registry::ExtractorRegistry;
pub use traits::{ResourceExtractor, ResourceId};

/// Jitter applied to the Drive throttler interval.
pub const DRIVE_WAIT_JITTER: f64 = 0.1;

impl ExtractorRegistry {
    /// Registry of every supported site, in dispatch order: Google Drive,
    /// Imgur, Dropbox.
    #[must_use]
    pub fn with_default_sites(http: &HttpClient, drive_wait: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(GoogleDriveExtractor::new(
            http.clone(),
            Throttler::new(drive_wait, DRIVE_WAIT_JITTER),
        )));
        registry.register(Box::new(ImgurExtractor::new(http.clone())));
        registry.register(Box::new(DropboxExtractor::new(http.clone())));
        registry
    }
}

/// Move `url` onto another scheme, host and port, keeping path and query.
pub(crate) fn rebase_origin(url: &Url, origin: &Url) -> Url {
    let mut rebased = origin.clone();
    rebased.set_path(url.path());
    rebased.set_query(url.query());
    rebased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RetryPolicy;

    #[test]
    fn test_default_sites_order() {
        let http = HttpClient::new(Duration::from_secs(5), RetryPolicy::default()).unwrap();
        let registry = ExtractorRegistry::with_default_sites(&http, Duration::from_secs(5));
        assert_eq!(registry.site_ids(), vec!["googledrive", "imgur", "dropbox"]);

        let dropbox = Url::parse("https://www.dropbox.com/s/a/b.zip?dl=0").unwrap();
        assert_eq!(registry.find(&dropbox).unwrap().site_id(), "dropbox");
        let unknown = Url::parse("https://twitter.com/someone").unwrap();
        assert!(registry.find(&unknown).is_none());
    }
}
