//! Local file-based state storage backend.
//!
//! All records live in one JSON document. Every write is a read-modify-write
//! under an in-process mutex and lands on disk through a temp file, `fsync`
//! and rename, so a crash leaves either the old or the new document.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, check_takeover};
use super::store::StateStore;
use super::types::{LiveResource, StateDocument, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackrecon";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.stackrecon`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            write_guard: Mutex::new(()),
        }
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            write_guard: Mutex::new(()),
        }
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::unavailable(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the state document, or an empty one if none exists.
    async fn read_document(&self) -> Result<StateDocument> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(StateDocument::new());
        }

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            StateError::unavailable(format!("Failed to read state file: {e}"))
        })?;

        let document: StateDocument = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        Ok(document)
    }

    /// Persists the document through a temp file and an atomic rename.
    async fn write_document(&self, document: &StateDocument) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = self.state_path.with_extension("tmp");
        write_synced(&temp_path, &content).await?;

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            StateError::unavailable(format!("Failed to rename state file: {e}"))
        })?;

        Ok(())
    }

    /// Applies `change` to the document under the write guard.
    async fn modify<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut StateDocument) + Send,
    {
        let _guard = self.write_guard.lock().await;
        let mut document = self.read_document().await?;
        change(&mut document);
        document.touch();
        self.write_document(&document).await
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            StateError::unavailable(format!("Failed to read lock file: {e}"))
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StackError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

/// Writes `content` to `path` and flushes it to disk.
async fn write_synced(path: &Path, content: &str) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| StateError::unavailable(format!("Failed to create {}: {e}", path.display())))?;

    file.write_all(content.as_bytes())
        .await
        .map_err(|e| StateError::unavailable(format!("Failed to write {}: {e}", path.display())))?;

    file.sync_all()
        .await
        .map_err(|e| StateError::unavailable(format!("Failed to sync {}: {e}", path.display())))?;

    Ok(())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, id: &str) -> Result<Option<LiveResource>> {
        let document = self.read_document().await?;
        Ok(document.resources.get(id).cloned())
    }

    async fn put(&self, id: &str, resource: LiveResource) -> Result<()> {
        debug!("Recording {id} ({}) in {}", resource.provider_id, self.state_path.display());
        let id = id.to_string();
        self.modify(move |doc| {
            doc.resources.insert(id, resource);
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        debug!("Forgetting {id} in {}", self.state_path.display());
        self.modify(|doc| {
            doc.resources.remove(id);
        })
        .await
    }

    async fn snapshot_all(&self) -> Result<StateSnapshot> {
        info!("Loading state from: {}", self.state_path.display());
        Ok(self.read_document().await?.resources)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let _guard = self.write_guard.lock().await;
        check_takeover(self.read_lock_file().await?.as_ref())?;

        let lock_info = LockInfo::new(holder);
        self.ensure_dir().await?;
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        write_synced(&self.lock_path, &content).await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: e.to_string(),
            })
        })?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        self.delete_lock_file().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
