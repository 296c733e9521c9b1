use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BlobStore, StoreError, StoreResult};

const STAGING_DIR: &str = ".staging";
const COMMITS_DIR: &str = ".commits";

/// Apply attempts made right after the commit point before deferring to replay.
const APPLY_ATTEMPTS: u32 = 3;

/// Staged blobs without a journal are swept on open once this old.
const STALE_STAGING_HOURS: i64 = 24;

/// Size metadata of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
}

/// Content of an added blob.
#[derive(Debug, Clone)]
pub enum CommitSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// One operation of a multi-operation commit.
#[derive(Debug, Clone)]
pub enum CommitOperation {
    Add {
        path_in_repo: String,
        source: CommitSource,
    },
    Delete {
        path_in_repo: String,
    },
}

impl CommitOperation {
    pub fn add_file(path_in_repo: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self::Add {
            path_in_repo: path_in_repo.into(),
            source: CommitSource::File(local.into()),
        }
    }

    pub fn add_bytes(path_in_repo: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Add {
            path_in_repo: path_in_repo.into(),
            source: CommitSource::Bytes(data.into()),
        }
    }

    pub fn delete(path_in_repo: impl Into<String>) -> Self {
        Self::Delete {
            path_in_repo: path_in_repo.into(),
        }
    }
}

/// Redo log persisted at the commit point.
#[derive(Debug, Serialize, Deserialize)]
struct CommitJournal {
    id: String,
    message: String,
    created_at: DateTime<Utc>,
    operations: Vec<JournalEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Add { staged: String, path: String },
    Delete { path: String },
}

/// A named namespace inside a blob store holding one crawl target.
///
/// All paths passed to a repository are relative to its namespace. The
/// namespace is created lazily; any commit interrupted after its commit point
/// is completed the next time the repository is opened.
#[derive(Debug, Clone)]
pub struct Repository {
    store: Arc<dyn BlobStore>,
    name: String,
    ready: Arc<Mutex<bool>>,
    /// Commits whose staged blobs could not be removed after they failed.
    abandoned: Arc<Mutex<Vec<String>>>,
}

impl Repository {
    pub fn new(store: Arc<dyn BlobStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into().trim_matches('/').to_string(),
            ready: Arc::new(Mutex::new(false)),
            abandoned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, path: &str) -> String {
        format!("{}/{}", self.name, path.trim_start_matches('/'))
    }

    fn journal_key(&self, id: &str) -> String {
        self.key(&format!("{COMMITS_DIR}/{id}.json"))
    }

    fn relative<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Create the repository if absent and finish any pending commits.
    ///
    /// Idempotent; after the first success this is a cheap flag check.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or a pending commit
    /// cannot be replayed.
    pub async fn ensure(&self) -> StoreResult<()> {
        let mut ready = self.ready.lock().await;
        if *ready {
            return Ok(());
        }

        self.store.ensure_root().await?;
        let replayed = self.replay_pending().await?;
        if replayed > 0 {
            info!(repository = %self.name, count = replayed, "Replayed pending commits");
        }

        *ready = true;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the backend request fails.
    pub async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.ensure().await?;
        self.store.exists(&self.key(path)).await
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for missing blobs, or a decoding error.
    pub async fn read_text(&self, path: &str) -> StoreResult<String> {
        self.ensure().await?;
        let data = self.store.read(&self.key(path)).await?;
        String::from_utf8(data).map_err(|e| StoreError::Backend(format!("{path} is not UTF-8: {e}")))
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_text(&self, path: &str, text: &str) -> StoreResult<()> {
        self.ensure().await?;
        self.store.write(&self.key(path), text.as_bytes()).await
    }

    /// List repository paths matching `pattern`, sorted.
    ///
    /// `*` matches any run of characters within one path segment; all other
    /// characters match literally.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn glob(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.ensure().await?;
        let matcher = glob_to_regex(pattern);
        let literal_dir = pattern
            .split('*')
            .next()
            .and_then(|literal| literal.rfind('/').map(|pos| &literal[..=pos]))
            .unwrap_or("");

        let keys = self.store.list(&self.key(literal_dir)).await?;
        let mut paths: Vec<String> = keys
            .iter()
            .filter_map(|key| self.relative(key))
            .filter(|path| matcher.is_match(path))
            .map(ToString::to_string)
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for missing blobs.
    pub async fn info(&self, path: &str) -> StoreResult<ObjectInfo> {
        self.ensure().await?;
        let size = self.store.size(&self.key(path)).await?;
        Ok(ObjectInfo { size })
    }

    /// # Errors
    ///
    /// Returns an error if the blob cannot be fetched or written locally.
    pub async fn download(&self, path: &str, local: &Path) -> StoreResult<()> {
        self.ensure().await?;
        debug!(repository = %self.name, path, local = %local.display(), "Downloading blob");
        self.store.download_to(&self.key(path), local).await
    }

    /// Upload a single file. Single-blob writes are atomic in every backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    pub async fn upload(&self, local: &Path, path: &str) -> StoreResult<()> {
        self.ensure().await?;
        debug!(repository = %self.name, path, local = %local.display(), "Uploading blob");
        self.store.upload_from(local, &self.key(path)).await
    }

    #[must_use]
    pub fn public_url(&self, path: &str) -> String {
        self.store.public_url(&self.key(path))
    }

    /// Apply a set of add/delete operations all-or-nothing.
    ///
    /// Added content is staged first, then a journal is written; writing the
    /// journal is the commit point. A failure before it leaves the repository
    /// untouched. Once it exists the commit is durable: if applying it fails
    /// here, it is completed by [`Repository::ensure`] before any further
    /// access.
    ///
    /// Returns the commit id.
    ///
    /// # Errors
    ///
    /// Returns an error if staging or journaling fails; nothing is visible in
    /// that case. Blobs staged by the failed attempt are removed, or by the
    /// next commit if the store is still failing.
    pub async fn commit(&self, operations: Vec<CommitOperation>, message: &str) -> StoreResult<String> {
        self.ensure().await?;
        self.discard_abandoned().await;

        let id = commit_id(message);
        let journal = match self.record(&id, operations, message).await {
            Ok(journal) => journal,
            Err(e) => {
                if let Err(cleanup) = self.discard_staging(&id).await {
                    debug!(commit = %id, "Failed to discard staged blobs, will retry: {cleanup}");
                    self.abandoned.lock().await.push(id);
                }
                return Err(e);
            }
        };
        debug!(repository = %self.name, commit = %id, "Commit recorded");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.apply(&journal).await {
                Ok(()) => break,
                Err(e) if attempt < APPLY_ATTEMPTS => {
                    debug!(commit = %id, attempt, "Applying commit failed, retrying: {e}");
                }
                Err(e) => {
                    warn!(
                        commit = %id,
                        "Commit recorded but not yet applied; it will be replayed: {e}"
                    );
                    *self.ready.lock().await = false;
                    break;
                }
            }
        }

        info!(repository = %self.name, commit = %id, message, "Commit complete");
        Ok(id)
    }

    /// Stage added content and write the journal.
    async fn record(
        &self,
        id: &str,
        operations: Vec<CommitOperation>,
        message: &str,
    ) -> StoreResult<CommitJournal> {
        let mut entries = Vec::with_capacity(operations.len());
        for (seq, operation) in operations.into_iter().enumerate() {
            match operation {
                CommitOperation::Add { path_in_repo, source } => {
                    let staged = format!("{STAGING_DIR}/{id}/{seq}");
                    let staged_key = self.key(&staged);
                    match source {
                        CommitSource::File(local) => self.store.upload_from(&local, &staged_key).await?,
                        CommitSource::Bytes(data) => self.store.write(&staged_key, &data).await?,
                    }
                    entries.push(JournalEntry::Add { staged, path: path_in_repo });
                }
                CommitOperation::Delete { path_in_repo } => {
                    entries.push(JournalEntry::Delete { path: path_in_repo });
                }
            }
        }

        let journal = CommitJournal {
            id: id.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
            operations: entries,
        };
        self.store
            .write(&self.journal_key(id), &serde_json::to_vec_pretty(&journal)?)
            .await?;
        Ok(journal)
    }

    /// Remove the staged blobs of a commit that never reached its journal.
    async fn discard_staging(&self, id: &str) -> StoreResult<()> {
        // A journal written despite a reported failure makes the commit durable.
        if self.store.exists(&self.journal_key(id)).await? {
            return Ok(());
        }
        for key in self.store.list(&self.key(&format!("{STAGING_DIR}/{id}/"))).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn discard_abandoned(&self) {
        let pending = std::mem::take(&mut *self.abandoned.lock().await);
        for id in pending {
            match self.discard_staging(&id).await {
                Ok(()) => debug!(commit = %id, "Discarded staged blobs of failed commit"),
                Err(e) => {
                    warn!(commit = %id, "Failed to discard staged blobs: {e}");
                    self.abandoned.lock().await.push(id);
                }
            }
        }
    }

    async fn apply(&self, journal: &CommitJournal) -> StoreResult<()> {
        for entry in &journal.operations {
            match entry {
                JournalEntry::Add { staged, path } => {
                    let staged_key = self.key(staged);
                    // A missing staged blob was already applied and cleaned up.
                    if self.store.exists(&staged_key).await? {
                        self.store.copy(&staged_key, &self.key(path)).await?;
                    }
                }
                JournalEntry::Delete { path } => {
                    self.store.delete(&self.key(path)).await?;
                }
            }
        }

        for entry in &journal.operations {
            if let JournalEntry::Add { staged, .. } = entry {
                self.store.delete(&self.key(staged)).await?;
            }
        }
        self.store.delete(&self.journal_key(&journal.id)).await
    }

    async fn replay_pending(&self) -> StoreResult<usize> {
        let keys = self.store.list(&self.key(&format!("{COMMITS_DIR}/"))).await?;
        let mut replayed = 0;
        for key in keys {
            let data = self.store.read(&key).await?;
            let journal: CommitJournal = serde_json::from_slice(&data)?;
            info!(commit = %journal.id, message = %journal.message, "Replaying interrupted commit");
            self.apply(&journal).await?;
            replayed += 1;
        }
        self.sweep_stale_staging().await?;
        Ok(replayed)
    }

    /// Delete staged blobs left by commits that crashed before their journal.
    ///
    /// Only commits older than [`STALE_STAGING_HOURS`] are swept, so a commit
    /// still staging in another process is left alone.
    async fn sweep_stale_staging(&self) -> StoreResult<()> {
        let staging_root = self.key(&format!("{STAGING_DIR}/"));
        let cutoff = (Utc::now() - chrono::Duration::hours(STALE_STAGING_HOURS))
            .format("%Y%m%d%H%M%S%6f")
            .to_string();

        for key in self.store.list(&staging_root).await? {
            let Some(id) = key
                .strip_prefix(staging_root.as_str())
                .and_then(|rest| rest.split('/').next())
            else {
                continue;
            };
            // Ids start with their creation time, so they compare like dates.
            if id.get(..cutoff.len()).is_some_and(|created| created < cutoff.as_str())
                && !self.store.exists(&self.journal_key(id)).await?
            {
                debug!(commit = %id, key = %key, "Removing stale staged blob");
                self.store.delete(&key).await?;
            }
        }
        Ok(())
    }
}

/// Sortable, collision-resistant commit id.
fn commit_id(message: &str) -> String {
    let now = Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(rand::random::<u64>().to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}_{}", now.format("%Y%m%d%H%M%S%6f"), &digest[..12])
}

fn glob_to_regex(pattern: &str) -> Regex {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/]*");
    Regex::new(&format!("^{body}$")).expect("escaped glob is a valid regex")
}
