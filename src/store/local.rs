use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{BlobStore, StoreError, StoreResult};

const TMP_SUFFIX: &str = ".partial";

/// Blob store rooted at a local directory.
///
/// Keys map to relative file paths. Writes go to a temporary sibling first and
/// are renamed into place, so readers never observe a half-written blob.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{:016x}{TMP_SUFFIX}", rand::random::<u64>()));
        path.with_file_name(name)
    }

    async fn ensure_parent(path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn not_found(key: &str, e: std::io::Error) -> StoreError {
        if e.kind() == ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io(e)
        }
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn ensure_root(&self) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(tokio::fs::try_exists(self.path(key)).await?)
    }

    async fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        tokio::fs::read(self.path(key))
            .await
            .map_err(|e| Self::not_found(key, e))
    }

    async fn write(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.path(key);
        Self::ensure_parent(&path).await?;

        let tmp = Self::temp_path(&path);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn size(&self, key: &str) -> StoreResult<u64> {
        let metadata = tokio::fs::metadata(self.path(key))
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(metadata.len())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        // Start from the deepest directory named by the prefix.
        let start_dir = prefix
            .rfind('/')
            .map_or_else(|| self.root.clone(), |pos| self.root.join(&prefix[..pos]));

        let mut keys = Vec::new();
        let mut stack = vec![start_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        let target = self.path(to);
        Self::ensure_parent(&target).await?;
        let tmp = Self::temp_path(&target);
        tokio::fs::copy(self.path(from), &tmp)
            .await
            .map_err(|e| Self::not_found(from, e))?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("file://{}", self.path(key).display())
    }

    async fn download_to(&self, key: &str, local: &Path) -> StoreResult<()> {
        Self::ensure_parent(local).await?;
        tokio::fs::copy(self.path(key), local)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(())
    }

    async fn upload_from(&self, local: &Path, key: &str) -> StoreResult<()> {
        let target = self.path(key);
        Self::ensure_parent(&target).await?;
        let tmp = Self::temp_path(&target);
        tokio::fs::copy(local, &tmp).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}
