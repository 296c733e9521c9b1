use url::Url;

use super::traits::ResourceExtractor;

/// Ordered set of extractors.
///
/// Lookup walks the extractors in registration order and returns the first
/// one that recognizes the URL. Later extractors are never consulted for that
/// URL, even if the winner cannot identify it.
#[derive(Debug, Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn ResourceExtractor>>,
}

impl ExtractorRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extractor after all existing ones.
    pub fn register(&mut self, extractor: Box<dyn ResourceExtractor>) {
        self.extractors.push(extractor);
    }

    /// Find the extractor owning a URL.
    #[must_use]
    pub fn find(&self, url: &Url) -> Option<&dyn ResourceExtractor> {
        self.extractors
            .iter()
            .find(|e| e.recognize(url))
            .map(AsRef::as_ref)
    }

    /// Registered site ids, in dispatch order.
    #[must_use]
    pub fn site_ids(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.site_id()).collect()
    }
}
