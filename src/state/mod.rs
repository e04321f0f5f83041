//! State management module.
//!
//! This module provides persistent storage for live resource records: the
//! provider id, last-applied attributes, outputs and dependencies of every
//! resource the engine has created.

mod store;
mod local;
mod memory;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
#[cfg(test)]
pub use store::MockStateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use types::{LiveResource, STATE_VERSION, StateDocument, StateSnapshot};
