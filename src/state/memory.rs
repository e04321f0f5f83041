//! In-process state store for tests and embedding.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::error::{Result, StateError};

use super::lock::{LockInfo, check_takeover};
use super::store::StateStore;
use super::types::{LiveResource, StateSnapshot};

/// State store backed by a map in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<StateSnapshot>,
    lock: Mutex<Option<LockInfo>>,
    /// When set, every operation fails with `StoreUnavailable`.
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `records`.
    #[must_use]
    pub fn with_records(records: StateSnapshot) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// Makes every subsequent operation fail, simulating a lost backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StateError::unavailable("memory store marked unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> Result<Option<LiveResource>> {
        self.check_available()?;
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn put(&self, id: &str, resource: LiveResource) -> Result<()> {
        self.check_available()?;
        self.records.lock().await.insert(id.to_string(), resource);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_available()?;
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn snapshot_all(&self) -> Result<StateSnapshot> {
        self.check_available()?;
        Ok(self.records.lock().await.clone())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.check_available()?;
        let mut lock = self.lock.lock().await;
        check_takeover(lock.as_ref())?;
        let info = LockInfo::new(holder);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
