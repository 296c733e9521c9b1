//! Archival of linked resources into bundles, and the crawl loop driving it.

pub mod bundle;
mod driver;
mod resource;
mod throttle;

pub use driver::{BatchDriver, CrawlSettings, CrawlStats};
pub use resource::{ArchiveOutcome, ResourceArchiver};
pub use throttle::Throttler;
