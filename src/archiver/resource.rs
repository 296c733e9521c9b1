use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use url::Url;

use super::bundle;
use crate::extractors::{ExtractorRegistry, ResourceId};
use crate::manifest::{bundle_path, ManifestStore};

/// Result of archiving a single URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// No registered site recognizes the URL.
    Unrecognized,
    /// A site recognized the URL but could not name the resource.
    Unresolved { site: &'static str },
    /// The resource is already archived or waiting to be packed.
    AlreadyArchived(ResourceId),
    /// The fetch produced no files; nothing was recorded.
    EmptyFetch(ResourceId),
    /// A new bundle was uploaded.
    Archived { id: ResourceId, size: u64 },
}

/// Turns URLs into bundles under `unarchived/`.
#[derive(Debug, Clone)]
pub struct ResourceArchiver {
    manifest: Arc<ManifestStore>,
    registry: Arc<ExtractorRegistry>,
    work_dir: PathBuf,
}

impl ResourceArchiver {
    pub fn new(manifest: Arc<ManifestStore>, registry: Arc<ExtractorRegistry>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            registry,
            work_dir: work_dir.into(),
        }
    }

    #[must_use]
    pub fn manifest(&self) -> &Arc<ManifestStore> {
        &self.manifest
    }

    /// Archive the resource behind `url`, naming bundle entries with `prefix`.
    ///
    /// Every resource is fetched at most once per repository: a resource that
    /// is archived or has a pending bundle is skipped without any network
    /// access. An empty fetch leaves no trace so a later run can retry it.
    ///
    /// The existence check and the upload are not done under a lock. Two
    /// processes crawling the same repository can both fetch a resource and
    /// upload its bundle; the second upload replaces the first. Within one
    /// [`BatchDriver`](super::BatchDriver) URLs are archived one at a time, so
    /// this cannot happen in a single crawl.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be reached, the fetch fails,
    /// or the bundle cannot be written or uploaded. Nothing is recorded in any
    /// of these cases.
    pub async fn archive(&self, url: &str, prefix: &str) -> Result<ArchiveOutcome> {
        let repo = self.manifest.repository();
        repo.ensure()
            .await
            .with_context(|| format!("Failed to open repository {}", repo.name()))?;

        let Ok(parsed) = Url::parse(url) else {
            info!(url, "Not a valid URL, skipping");
            return Ok(ArchiveOutcome::Unrecognized);
        };
        let Some(extractor) = self.registry.find(&parsed) else {
            info!(url, "No extractor recognizes URL");
            return Ok(ArchiveOutcome::Unrecognized);
        };
        let site = extractor.site_id();
        let Some(id) = extractor.identify(&parsed).await else {
            info!(url, site, "Could not resolve a resource id");
            return Ok(ArchiveOutcome::Unresolved { site });
        };

        if self
            .manifest
            .is_resource_exist(id.as_str())
            .await
            .with_context(|| format!("Failed to check whether {id} exists"))?
        {
            info!(url, resource_id = %id, "Already archived");
            return Ok(ArchiveOutcome::AlreadyArchived(id));
        }

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("fetch-")
            .tempdir_in(&self.work_dir)
            .context("Failed to create scratch directory")?;
        let fetch_dir = scratch.path().join("files");
        tokio::fs::create_dir_all(&fetch_dir)
            .await
            .context("Failed to create fetch directory")?;

        info!(url, site, resource_id = %id, "Fetching resource");
        extractor
            .fetch(&parsed, &fetch_dir)
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;

        let zip_path = scratch.path().join(format!("{id}.zip"));
        let entries = {
            let (source, target, prefix) = (fetch_dir.clone(), zip_path.clone(), prefix.to_string());
            tokio::task::spawn_blocking(move || bundle::write_bundle(&source, &target, &prefix))
                .await
                .context("Bundle task panicked")??
        };
        if entries == 0 {
            info!(url, resource_id = %id, "Fetch produced no files, will retry on a later run");
            return Ok(ArchiveOutcome::EmptyFetch(id));
        }

        let size = tokio::fs::metadata(&zip_path)
            .await
            .context("Failed to stat bundle")?
            .len();
        repo.upload(&zip_path, &bundle_path(id.as_str()))
            .await
            .with_context(|| format!("Failed to upload bundle for {id}"))?;

        info!(url, resource_id = %id, entries, size, "Archived resource");
        Ok(ArchiveOutcome::Archived { id, size })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::extractors::ResourceExtractor;
    use crate::store::{MemoryBlobStore, Repository};

    /// Writes a fixed list of files for any `test.invalid` URL.
    #[derive(Debug)]
    struct StaticSite {
        files: Vec<(&'static str, &'static [u8])>,
    }

    #[async_trait]
    impl ResourceExtractor for StaticSite {
        fn site_id(&self) -> &'static str {
            "static"
        }

        fn recognize(&self, url: &Url) -> bool {
            url.host_str() == Some("test.invalid")
        }

        async fn identify(&self, url: &Url) -> Option<ResourceId> {
            let name = url.path().trim_matches('/');
            (!name.is_empty()).then(|| ResourceId::new(format!("static_{name}")))
        }

        async fn fetch(&self, _url: &Url, dest: &Path) -> Result<()> {
            for (name, data) in &self.files {
                tokio::fs::write(dest.join(name), data).await?;
            }
            Ok(())
        }
    }

    fn archiver(files: Vec<(&'static str, &'static [u8])>, work: &TempDir) -> (MemoryBlobStore, ResourceArchiver) {
        let store = MemoryBlobStore::new();
        let repo = Repository::new(Arc::new(store.clone()), "owner/repo");
        let mut registry = ExtractorRegistry::new();
        registry.register(Box::new(StaticSite { files }));
        let archiver = ResourceArchiver::new(
            Arc::new(ManifestStore::new(repo)),
            Arc::new(registry),
            work.path().join("work"),
        );
        (store, archiver)
    }

    #[tokio::test]
    async fn test_archive_uploads_bundle_once() {
        let work = TempDir::new().unwrap();
        let (store, archiver) = archiver(vec![("a b.png", &b"png"[..])], &work);

        let first = archiver.archive("https://test.invalid/one", "u_1_").await.unwrap();
        assert!(matches!(first, ArchiveOutcome::Archived { ref id, .. } if id.as_str() == "static_one"));
        assert!(store.get("owner/repo/unarchived/static_one.zip").is_some());

        let second = archiver.archive("https://test.invalid/one", "u_1_").await.unwrap();
        assert_eq!(second, ArchiveOutcome::AlreadyArchived(ResourceId::new("static_one")));
    }

    #[tokio::test]
    async fn test_unrecognized_and_unresolved_are_skips() {
        let work = TempDir::new().unwrap();
        let (store, archiver) = archiver(vec![("a.txt", &b"a"[..])], &work);

        assert_eq!(
            archiver.archive("https://elsewhere.invalid/x", "").await.unwrap(),
            ArchiveOutcome::Unrecognized
        );
        assert_eq!(archiver.archive("not a url", "").await.unwrap(), ArchiveOutcome::Unrecognized);
        assert_eq!(
            archiver.archive("https://test.invalid/", "").await.unwrap(),
            ArchiveOutcome::Unresolved { site: "static" }
        );
        assert!(store.keys().iter().all(|key| !key.contains("unarchived/")));
    }

    #[tokio::test]
    async fn test_empty_fetch_records_nothing() {
        let work = TempDir::new().unwrap();
        let (store, archiver) = archiver(Vec::new(), &work);

        let outcome = archiver.archive("https://test.invalid/empty", "").await.unwrap();
        assert_eq!(outcome, ArchiveOutcome::EmptyFetch(ResourceId::new("static_empty")));
        assert!(store.get("owner/repo/unarchived/static_empty.zip").is_none());
        assert!(!archiver.manifest().is_resource_exist("static_empty").await.unwrap());
    }

    #[tokio::test]
    async fn test_scratch_is_removed() {
        let work = TempDir::new().unwrap();
        let (_store, archiver) = archiver(vec![("a.txt", &b"a"[..])], &work);
        archiver.archive("https://test.invalid/one", "").await.unwrap();
        archiver.archive("https://test.invalid/two", "").await.unwrap();

        let leftovers = std::fs::read_dir(work.path().join("work")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_an_error() {
        let work = TempDir::new().unwrap();
        let (store, archiver) = archiver(vec![("a.txt", &b"a"[..])], &work);
        store.set_unavailable(true);
        assert!(archiver.archive("https://test.invalid/one", "").await.is_err());
    }
}
