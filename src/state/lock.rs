//! Advisory single-writer lock.
//!
//! The lock keeps two `apply` runs from writing the same state at once. It
//! is advisory: readers (`plan`, `drift`) ignore it, and an expired lock may
//! be taken over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 900;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock for `holder`, generating a holder id if it is empty.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Fails with `LockedByOther` if `existing` is a live lock.
///
/// # Errors
///
/// Returns [`StateError::LockedByOther`] when an unexpired lock is present.
pub fn check_takeover(existing: Option<&LockInfo>) -> Result<()> {
    match existing {
        Some(lock) if !lock.is_expired() => Err(StateError::LockedByOther {
            holder: lock.holder.clone(),
            since: lock.acquired_at.to_rfc3339(),
        }
        .into()),
        Some(lock) => {
            debug!("Expired lock held by {} found, taking over", lock.holder);
            Ok(())
        }
        None => Ok(()),
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}
