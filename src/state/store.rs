//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::{LiveResource, StateSnapshot};

/// Trait for state storage backends.
///
/// Each write is atomic per logical id. The store does not arbitrate between
/// concurrent planners; callers that need exclusivity take the advisory lock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Gets the record for a logical id.
    async fn get(&self, id: &str) -> Result<Option<LiveResource>>;

    /// Writes the record for a logical id.
    async fn put(&self, id: &str, resource: LiveResource) -> Result<()>;

    /// Removes the record for a logical id. Missing ids are not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Reads every record.
    async fn snapshot_all(&self) -> Result<StateSnapshot>;

    /// Acquires the advisory lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the advisory lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn get(&self, id: &str) -> Result<Option<LiveResource>> {
        (**self).get(id).await
    }

    async fn put(&self, id: &str, resource: LiveResource) -> Result<()> {
        (**self).put(id, resource).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        (**self).delete(id).await
    }

    async fn snapshot_all(&self) -> Result<StateSnapshot> {
        (**self).snapshot_all().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
