//! Archival state kept inside a repository.
//!
//! The manifest is the pair of `archived.json` (every resource id already
//! folded into a pack) and `index.json` (every pack with its size). Both are
//! plain JSON blobs; absent blobs read as empty collections.

mod readme;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::constants::{ARCHIVED_FILE, INDEX_FILE, PACKS_DIR, UNARCHIVED_DIR};
use crate::store::{Repository, StoreError, StoreResult};

pub use readme::{format_size, render_readme};

/// One entry of `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRecord {
    pub filename: String,
    pub size: u64,
}

/// Repository path of the unarchived bundle for `resource_id`.
#[must_use]
pub fn bundle_path(resource_id: &str) -> String {
    format!("{UNARCHIVED_DIR}/{resource_id}.zip")
}

/// Repository path of a pack.
#[must_use]
pub fn pack_path(filename: &str) -> String {
    format!("{PACKS_DIR}/{filename}")
}

/// Resource id encoded in an unarchived bundle path.
#[must_use]
pub fn resource_id_of(bundle: &str) -> Option<&str> {
    let name = bundle.rsplit('/').next()?;
    name.strip_suffix(".zip").filter(|id| !id.is_empty())
}

/// Append `new_ids` to `ids`, skipping any already present. Order is kept.
#[must_use]
pub fn merge_archived_ids<I>(mut ids: Vec<String>, new_ids: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen: HashSet<String> = ids.iter().cloned().collect();
    for id in new_ids {
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    ids
}

fn to_json_4<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// Serialize `archived.json`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_archived(ids: &[String]) -> serde_json::Result<Vec<u8>> {
    to_json_4(ids)
}

/// Serialize `index.json`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_index(records: &[PackRecord]) -> serde_json::Result<Vec<u8>> {
    to_json_4(records)
}

/// Read access to the manifest, with the archived set cached per process.
#[derive(Debug)]
pub struct ManifestStore {
    repo: Repository,
    archived: Mutex<Option<Arc<HashSet<String>>>>,
}

impl ManifestStore {
    #[must_use]
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            archived: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Read `archived.json` in stored order; empty if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob exists but cannot be read or decoded.
    pub async fn load_archived_ids(&self) -> StoreResult<Vec<String>> {
        match self.repo.read_text(ARCHIVED_FILE).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// The archived set, loaded on first use and cached until invalidated.
    ///
    /// # Errors
    ///
    /// Returns an error if `archived.json` cannot be loaded.
    pub async fn archived_set(&self) -> StoreResult<Arc<HashSet<String>>> {
        let mut cached = self.archived.lock().await;
        if let Some(set) = cached.as_ref() {
            return Ok(Arc::clone(set));
        }

        let set: Arc<HashSet<String>> = Arc::new(self.load_archived_ids().await?.into_iter().collect());
        debug!(count = set.len(), "Loaded archived resource ids");
        *cached = Some(Arc::clone(&set));
        Ok(set)
    }

    /// Drop the cached archived set so the next lookup reloads it.
    pub async fn invalidate(&self) {
        *self.archived.lock().await = None;
    }

    /// Whether `resource_id` is already archived or waiting in `unarchived/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be queried.
    pub async fn is_resource_exist(&self, resource_id: &str) -> StoreResult<bool> {
        if self.archived_set().await?.contains(resource_id) {
            return Ok(true);
        }
        self.repo.exists(&bundle_path(resource_id)).await
    }

    /// Read `index.json`, or rebuild it from the packs present.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be read.
    pub async fn load_index(&self) -> StoreResult<Vec<PackRecord>> {
        match self.repo.read_text(INDEX_FILE).await {
            Ok(text) => return Ok(serde_json::from_str(&text)?),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut records = Vec::new();
        for path in self.repo.glob(&format!("{PACKS_DIR}/*.zip")).await? {
            let info = self.repo.info(&path).await?;
            let filename = path.rsplit('/').next().unwrap_or(&path).to_string();
            records.push(PackRecord {
                filename,
                size: info.size,
            });
        }
        debug!(count = records.len(), "Rebuilt pack index from listing");
        Ok(records)
    }
}
