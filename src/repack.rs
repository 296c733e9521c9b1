//! Compaction of unarchived bundles into size-bounded packs.
//!
//! A repack moves a batch of resources from `unarchived/` into one new pack
//! under `packs/` and records them in `archived.json`, `index.json` and the
//! README, all in a single repository commit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::archiver::bundle;
use crate::config::Config;
use crate::constants::{ARCHIVED_FILE, INDEX_FILE, README_FILE, UNARCHIVED_DIR};
use crate::manifest::{
    encode_archived, encode_index, merge_archived_ids, pack_path, render_readme, resource_id_of,
    ManifestStore, PackRecord,
};
use crate::store::{CommitOperation, StoreResult};

/// How a failed repack commit is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRetry {
    pub interval: Duration,
    /// `None` retries until the commit succeeds.
    pub max_attempts: Option<u32>,
}

impl Default for CommitRetry {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Bundles selected by [`Repacker::repack_zips`], ready to be committed.
#[derive(Debug)]
pub struct RepackBatch {
    _scratch: TempDir,
    /// The consolidated pack, if any bundle yielded files.
    pub package: Option<PathBuf>,
    /// Bundle paths folded into `package`, in listing order.
    pub consumed: Vec<String>,
    /// Bundle paths whose resource is already archived.
    pub orphans: Vec<String>,
}

/// Admits sizes while the running total stays strictly below the limit.
///
/// Once one size is refused, every later one is refused too.
#[derive(Debug)]
struct SizeBudget {
    limit: u64,
    used: u64,
    closed: bool,
}

impl SizeBudget {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            closed: false,
        }
    }

    fn admit(&mut self, size: u64) -> bool {
        if self.closed {
            return false;
        }
        let total = self.used.saturating_add(size);
        if total >= self.limit {
            self.closed = true;
            return false;
        }
        self.used = total;
        true
    }
}

/// File name of a pack created at `at`. Names sort chronologically.
#[must_use]
pub fn pack_file_name(at: &DateTime<Local>) -> String {
    format!("pack_{}.zip", at.format("%Y%m%d_%H%M%S_%6f"))
}

pub struct Repacker {
    manifest: Arc<ManifestStore>,
    work_dir: PathBuf,
    retry: CommitRetry,
}

impl Repacker {
    pub fn new(manifest: Arc<ManifestStore>, work_dir: impl Into<PathBuf>, retry: CommitRetry) -> Self {
        Self {
            manifest,
            work_dir: work_dir.into(),
            retry,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, manifest: Arc<ManifestStore>) -> Self {
        let retry = CommitRetry {
            interval: config.commit_retry_interval,
            max_attempts: None,
        };
        Self::new(manifest, config.work_dir.clone(), retry)
    }

    /// Download and merge pending bundles into one local pack.
    ///
    /// Bundles are taken in listing order while their total size stays below
    /// `max_size`. A bundle that cannot be extracted is logged and still
    /// counted as consumed. Bundles of already archived resources are
    /// returned as orphans and not repacked.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be read or local files
    /// cannot be written.
    pub async fn repack_zips(&self, max_size: u64) -> Result<RepackBatch> {
        let repo = self.manifest.repository();
        let archived = self
            .manifest
            .archived_set()
            .await
            .context("Failed to load archived resource ids")?;
        let bundles = repo
            .glob(&format!("{UNARCHIVED_DIR}/*.zip"))
            .await
            .context("Failed to list unarchived bundles")?;

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("repack-")
            .tempdir_in(&self.work_dir)
            .context("Failed to create scratch directory")?;
        let download_dir = scratch.path().join("download");
        let extract_dir = scratch.path().join("files");
        tokio::fs::create_dir_all(&download_dir).await?;
        tokio::fs::create_dir_all(&extract_dir).await?;

        let mut budget = SizeBudget::new(max_size);
        let mut consumed = Vec::new();
        let mut orphans = Vec::new();

        for path in bundles {
            let Some(id) = resource_id_of(&path).map(ToString::to_string) else {
                continue;
            };
            if archived.contains(&id) {
                warn!(bundle = %path, "Bundle of an archived resource left over, removing");
                orphans.push(path);
                continue;
            }
            if budget.closed {
                continue;
            }

            let size = repo
                .info(&path)
                .await
                .with_context(|| format!("Failed to stat {path}"))?
                .size;
            if !budget.admit(size) {
                debug!(bundle = %path, size, "Pack size limit reached");
                continue;
            }

            let local = download_dir.join(format!("{id}.zip"));
            repo.download(&path, &local)
                .await
                .with_context(|| format!("Failed to download {path}"))?;

            let dest = extract_dir.join(&id);
            let extracted = {
                let (zip, dest) = (local.clone(), dest.clone());
                tokio::task::spawn_blocking(move || bundle::extract_zip(&zip, &dest))
                    .await
                    .context("Extract task panicked")?
            };
            match extracted {
                Ok(entries) => debug!(bundle = %path, entries, "Extracted bundle"),
                Err(e) => {
                    warn!(bundle = %path, "Skipping unreadable bundle: {e:#}");
                    let _ = tokio::fs::remove_dir_all(&dest).await;
                }
            }
            if let Err(e) = tokio::fs::remove_file(&local).await {
                warn!(path = %local.display(), "Failed to remove downloaded bundle: {e}");
            }
            consumed.push(path);
        }

        let package = if consumed.is_empty() {
            None
        } else {
            let zip_path = scratch.path().join(pack_file_name(&Local::now()));
            let entries = {
                let (source, target) = (extract_dir.clone(), zip_path.clone());
                tokio::task::spawn_blocking(move || bundle::pack_directory(&source, &target))
                    .await
                    .context("Pack task panicked")??
            };
            info!(bundles = consumed.len(), entries, "Built pack");
            (entries > 0).then_some(zip_path)
        };

        Ok(RepackBatch {
            _scratch: scratch,
            package,
            consumed,
            orphans,
        })
    }

    /// Fold pending bundles into a new pack and commit the manifest update.
    ///
    /// Returns the new pack's index record, or `None` when no pack was made.
    /// Without a pack nothing is committed apart from removing leftover
    /// bundles of already archived resources; bundles that yielded no files
    /// stay in `unarchived/`.
    ///
    /// # Errors
    ///
    /// Returns an error if building the pack fails, or if the commit fails
    /// with a non-transient error or exhausts its retries. The repository is
    /// unchanged in every error case.
    pub async fn repack_all(&self, max_size: u64) -> Result<Option<PackRecord>> {
        let batch = self.repack_zips(max_size).await?;
        let Some(package) = &batch.package else {
            if !batch.consumed.is_empty() {
                warn!(
                    bundles = batch.consumed.len(),
                    "No bundle yielded files, leaving them in place"
                );
            }
            if !batch.orphans.is_empty() {
                self.remove_orphans(&batch.orphans).await?;
            }
            info!("Nothing to repack");
            return Ok(None);
        };

        let repo = self.manifest.repository();
        let archived = self
            .manifest
            .load_archived_ids()
            .await
            .context("Failed to read archived resource ids")?;
        let mut index = self.manifest.load_index().await.context("Failed to read pack index")?;
        let mut operations = Vec::new();

        let size = tokio::fs::metadata(package)
            .await
            .context("Failed to stat pack")?
            .len();
        let filename = package
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("Pack has no file name")?;
        operations.push(CommitOperation::add_file(pack_path(&filename), package.clone()));
        let record = PackRecord { filename, size };
        index.push(record.clone());

        for path in batch.consumed.iter().chain(&batch.orphans) {
            operations.push(CommitOperation::delete(path.clone()));
        }

        let archived = merge_archived_ids(
            archived,
            batch
                .consumed
                .iter()
                .filter_map(|path| resource_id_of(path))
                .map(ToString::to_string),
        );
        let readme = render_readme(&index, |filename| repo.public_url(&pack_path(filename)));
        operations.push(CommitOperation::add_bytes(ARCHIVED_FILE, encode_archived(&archived)?));
        operations.push(CommitOperation::add_bytes(INDEX_FILE, encode_index(&index)?));
        operations.push(CommitOperation::add_bytes(README_FILE, readme));

        let message = format!("Repack {} bundles into {}", batch.consumed.len(), record.filename);
        let commit = self
            .commit_with_retry(operations, &message)
            .await
            .context("Failed to commit repack")?;
        self.manifest.invalidate().await;

        info!(
            commit = %commit,
            bundles = batch.consumed.len(),
            orphans = batch.orphans.len(),
            pack = %record.filename,
            "Repack committed"
        );
        Ok(Some(record))
    }

    async fn remove_orphans(&self, orphans: &[String]) -> Result<()> {
        let operations = orphans.iter().cloned().map(CommitOperation::delete).collect();
        let message = format!("Remove {} bundles of archived resources", orphans.len());
        let commit = self
            .commit_with_retry(operations, &message)
            .await
            .context("Failed to remove leftover bundles")?;
        info!(commit = %commit, orphans = orphans.len(), "Leftover bundles removed");
        Ok(())
    }

    async fn commit_with_retry(&self, operations: Vec<CommitOperation>, message: &str) -> StoreResult<String> {
        let repo = self.manifest.repository();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match repo.commit(operations.clone(), message).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && !self.retry.max_attempts.is_some_and(|max| attempt >= max) => {
                    warn!(
                        attempt,
                        retry_in = ?self.retry.interval,
                        "Commit failed, retrying: {e}"
                    );
                    tokio::time::sleep(self.retry.interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
