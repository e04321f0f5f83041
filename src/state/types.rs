//! State types for tracking live resources.
//!
//! These types represent the recorded state of deployed resources, used by
//! the differ, the executor and the drift reporter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{Attributes, ResourceKind};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Every stored record, keyed by logical id.
pub type StateSnapshot = BTreeMap<String, LiveResource>;

/// The last-applied view of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveResource {
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Attributes as last applied.
    #[serde(default)]
    pub attributes: Attributes,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Attributes,
    /// Logical ids this resource depended on when it was applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Whether deleting this resource only forgets the record.
    #[serde(default)]
    pub retain_on_delete: bool,
    /// When this record was last written.
    pub last_reconciled: DateTime<Utc>,
}

impl LiveResource {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(provider_id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            provider_id: provider_id.into(),
            kind,
            attributes: BTreeMap::new(),
            outputs: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            retain_on_delete: false,
            last_reconciled: Utc::now(),
        }
    }

    /// Looks an output up by name; `id` is always the provider id.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(Value::String(self.provider_id.clone()));
        }
        self.outputs.get(name).cloned()
    }
}

/// On-disk document used by the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub version: String,
    /// Records keyed by logical id.
    #[serde(default)]
    pub resources: StateSnapshot,
    /// When the document was last written.
    pub last_updated: DateTime<Utc>,
}

impl StateDocument {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: String::from(STATE_VERSION),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Marks the document as updated now.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}
