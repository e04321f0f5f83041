//! Configuration specification types for the reconciliation engine.
//!
//! This module defines all the structs that map to the `stackrecon.yaml` file.
//! These types are declarative and fully describe the desired state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use validator::Validate;

use crate::graph::ResourceKind;

/// The root configuration structure for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct StackConfig {
    /// Stack-level metadata.
    pub stack: StackInfo,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider endpoint configuration.
    #[serde(default)]
    #[validate(nested)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    #[validate(nested)]
    pub execution: ExecutionConfig,
    /// Declared resources, in order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Values exported after apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
}

/// Stack-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackInfo {
    /// Stack name.
    pub name: String,
    /// Environment (e.g., "dev", "production").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    #[serde(default)]
    #[validate(url)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Maximum provider calls in flight at once.
    #[serde(default = "default_max_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub max_parallelism: usize,
    /// Retry policy for transient provider failures.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RetryConfig {
    /// Total attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Logical id, unique within the stack.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Declared attributes; strings may contain `ref(id, output)` expressions.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit dependencies beyond those implied by references.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle options.
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

/// Per-resource lifecycle options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Lifecycle {
    /// Create the replacement before deleting the old resource.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Forget the resource instead of deleting it at the provider.
    #[serde(default)]
    pub retain_on_delete: bool,
}

/// A stack output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Output value; usually a `ref(id, output)` expression.
    pub value: Value,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    200
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl StackConfig {
    /// Gets a resource by logical id.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Returns the qualified stack name (`name-environment`).
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.stack.name, self.stack.environment)
    }
}
