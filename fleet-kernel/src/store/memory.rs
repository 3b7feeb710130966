//! In-memory chunk store with injectable failures, for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{ChunkStore, SnapshotChunk, StoreError};

#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<BTreeMap<(String, String), SnapshotChunk>>,
    fail_creates: AtomicU32,
    fail_deletes: AtomicU32,
    unavailable: AtomicBool,
    create_calls: AtomicU32,
    delete_calls: AtomicU32,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` create calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// The next `n` delete calls fail.
    pub fn fail_next_deletes(&self, n: u32) {
        self.fail_deletes.store(n, Ordering::SeqCst);
    }

    /// Every call fails while set.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn insert_raw(&self, chunk: SnapshotChunk) {
        self.chunks
            .lock()
            .insert((chunk.namespace.clone(), chunk.name.clone()), chunk);
    }

    pub fn names(&self, namespace: &str) -> Vec<String> {
        self.chunks
            .lock()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked down".into()));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn list(&self, namespace: &str) -> Result<Vec<SnapshotChunk>, StoreError> {
        self.check_up()?;
        Ok(self
            .chunks
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn create(&self, chunk: &SnapshotChunk) -> Result<(), StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check_up()?;
        if Self::take_failure(&self.fail_creates) {
            return Err(StoreError::Unavailable(format!("injected create failure for {}", chunk.name)));
        }
        let key = (chunk.namespace.clone(), chunk.name.clone());
        let mut chunks = self.chunks.lock();
        if chunks.contains_key(&key) {
            return Err(StoreError::AlreadyExists(chunk.name.clone()));
        }
        chunks.insert(key, chunk.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_up()?;
        if Self::take_failure(&self.fail_deletes) {
            return Err(StoreError::Unavailable(format!("injected delete failure for {}", name)));
        }
        self.chunks
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}
