use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{BlobStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    unavailable: bool,
    writes_left: Option<usize>,
    size_requests: usize,
}

/// In-process blob store with fault injection, used by tests.
///
/// Clones share the same state, so a test can keep a handle for inspection
/// while the pipeline owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every mutating operation fail with a transient error, or heal.
    ///
    /// Healing also clears any [`MemoryBlobStore::fail_after_writes`] budget.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut state = self.lock();
        state.unavailable = unavailable;
        state.writes_left = None;
    }

    /// Allow `count` more mutating operations, then fail like an outage.
    pub fn fail_after_writes(&self, count: usize) {
        self.lock().writes_left = Some(count);
    }

    /// Seed a blob, bypassing fault injection.
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        self.lock().objects.insert(key.into(), data);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Number of size lookups served so far.
    #[must_use]
    pub fn size_requests(&self) -> usize {
        self.lock().size_requests
    }

    fn begin_write(state: &mut MemoryState, key: &str) -> StoreResult<()> {
        if state.unavailable {
            return Err(StoreError::Transient(format!("write to {key} rejected")));
        }
        match state.writes_left {
            Some(0) => {
                state.unavailable = true;
                Err(StoreError::Transient(format!("write to {key} rejected")))
            }
            Some(left) => {
                state.writes_left = Some(left - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_root(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.lock().objects.contains_key(key))
    }

    async fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let mut state = self.lock();
        Self::begin_write(&mut state, key)?;
        state.objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn size(&self, key: &str) -> StoreResult<u64> {
        let mut state = self.lock();
        state.size_requests += 1;
        state
            .objects
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        let mut state = self.lock();
        Self::begin_write(&mut state, to)?;
        let data = state
            .objects
            .get(from)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(from.to_string()))?;
        state.objects.insert(to.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut state = self.lock();
        Self::begin_write(&mut state, key)?;
        state.objects.remove(key);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}
