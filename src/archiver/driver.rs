use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::resource::{ArchiveOutcome, ResourceArchiver};
use crate::config::Config;
use crate::source::{extract_urls, PostReference, PostSource, PostStream};

/// Pacing of a crawl run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSettings {
    /// Pause after any failed URL or post.
    pub cooldown: Duration,
    /// Minimum wall-clock time spent per post.
    pub timespan: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(10),
            timespan: Duration::from_secs(4),
        }
    }
}

impl CrawlSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            cooldown: config.crash_cooldown,
            timespan: config.post_timespan,
        }
    }
}

/// Counters of a finished crawl run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub posts: usize,
    pub urls: usize,
    pub archived: usize,
    pub skipped: usize,
    pub empty: usize,
    pub failed: usize,
}

/// Walks a post listing and archives every link found in each post.
///
/// Posts are handled one at a time. A failing URL or post is logged and
/// followed by the cooldown; it never ends the run.
pub struct BatchDriver {
    archiver: ResourceArchiver,
    source: Arc<dyn PostSource>,
    settings: CrawlSettings,
}

impl BatchDriver {
    pub fn new(archiver: ResourceArchiver, source: Arc<dyn PostSource>, settings: CrawlSettings) -> Self {
        Self {
            archiver,
            source,
            settings,
        }
    }

    /// Process posts until the listing is exhausted, fails, or `limit` posts
    /// have been handled.
    pub async fn run(&self, mut posts: PostStream<'_>, limit: Option<usize>) -> CrawlStats {
        let mut stats = CrawlStats::default();

        loop {
            if limit.is_some_and(|limit| stats.posts >= limit) {
                break;
            }
            let post = match posts.next().await {
                Some(Ok(post)) => post,
                Some(Err(e)) => {
                    error!("Post listing failed, ending run: {e:#}");
                    break;
                }
                None => break,
            };

            stats.posts += 1;
            let started = Instant::now();
            self.process_post(&post, &mut stats).await;

            let spent = started.elapsed();
            if spent < self.settings.timespan {
                tokio::time::sleep(self.settings.timespan - spent).await;
            }
        }

        info!(
            posts = stats.posts,
            urls = stats.urls,
            archived = stats.archived,
            skipped = stats.skipped,
            empty = stats.empty,
            failed = stats.failed,
            "Crawl finished"
        );
        stats
    }

    async fn process_post(&self, post: &PostReference, stats: &mut CrawlStats) {
        let text = match self.source.post_text(post).await {
            Ok(text) => text,
            Err(e) => {
                stats.failed += 1;
                error!(post = %post, "Failed to fetch post: {e:#}");
                tokio::time::sleep(self.settings.cooldown).await;
                return;
            }
        };

        let urls = extract_urls(&text);
        debug!(post = %post, count = urls.len(), "Found links");
        let prefix = post.bundle_prefix();

        for url in urls {
            stats.urls += 1;
            match self.archiver.archive(&url, &prefix).await {
                Ok(ArchiveOutcome::Archived { .. }) => stats.archived += 1,
                Ok(ArchiveOutcome::EmptyFetch(_)) => stats.empty += 1,
                Ok(
                    ArchiveOutcome::Unrecognized
                    | ArchiveOutcome::Unresolved { .. }
                    | ArchiveOutcome::AlreadyArchived(_),
                ) => stats.skipped += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!(post = %post, url = %url, "Failed to archive: {e:#}");
                    tokio::time::sleep(self.settings.cooldown).await;
                }
            }
        }
    }
}
