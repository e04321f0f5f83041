//! Error types for the stackrecon reconciliation engine.
//!
//! This module provides the error hierarchy for every phase of a
//! reconciliation cycle: configuration, graph construction, state storage,
//! planning, provider calls, and reconciliation.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the reconciliation engine.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State store errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Errors raised while building the resource graph.
///
/// All of these are fatal and are raised before any provider call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Logical ids along the cycle; the first id is repeated at the end.
        path: Vec<String>,
    },

    /// A reference or explicit dependency names an undeclared resource.
    #[error("Resource '{from}' references undeclared resource '{missing}'")]
    UnresolvedReference {
        /// Resource holding the reference.
        from: String,
        /// The logical id that could not be found.
        missing: String,
    },

    /// Two resources share a logical id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated logical id.
        id: String,
    },

    /// A resource references its own outputs.
    #[error("Resource '{id}' references itself")]
    SelfReference {
        /// The offending logical id.
        id: String,
    },

    /// A `ref(...)` expression could not be parsed.
    #[error("Resource '{id}' has a malformed reference: {expression}")]
    InvalidReference {
        /// Resource holding the expression.
        id: String,
        /// The malformed expression.
        expression: String,
    },
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The backing storage could not be read or written.
    #[error("State store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the I/O failure.
        message: String,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors returned by a cloud provider call.
///
/// Transient variants are retried by the executor; everything else is
/// reported against the step that raised it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider throttled the request.
    #[error("Provider throttled the request, retry after {retry_after_ms}ms")]
    Throttled {
        /// Suggested wait before retrying, in milliseconds.
        retry_after_ms: u64,
    },

    /// The request timed out.
    #[error("Provider request timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// Transport-level failure.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The provider reported a temporary outage.
    #[error("Provider temporarily unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The resource does not exist at the provider.
    #[error("Resource not found: {kind}/{provider_id}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Provider-assigned identifier.
        provider_id: String,
    },

    /// Credentials were rejected.
    #[error("Provider authentication failed: {message}")]
    Authentication {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected the request.
    #[error("Provider rejected the request ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Transient failures persisted through every retry.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final transient error.
        last_error: String,
    },

    /// The provider returned something unparseable.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// A reference could not be resolved at apply time.
    #[error("Cannot resolve ref({id}, {output}): output not available")]
    UnresolvedValue {
        /// Referenced logical id.
        id: String,
        /// Referenced output name.
        output: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The change-set cannot be ordered.
    #[error("Plan is unschedulable, steps form a cycle: {}", steps.join(" -> "))]
    Unschedulable {
        /// Steps involved in the cycle.
        steps: Vec<String>,
    },

    /// The re-computed plan differs from the one the operator approved.
    #[error("Plan is stale: expected fingerprint {expected}, computed {actual}")]
    StalePlan {
        /// Fingerprint supplied by the operator.
        expected: String,
        /// Fingerprint of the freshly computed plan.
        actual: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A store write failed mid-apply; the run stopped after the current wave.
    #[error("Reconciliation aborted after wave {wave}: {reason}")]
    Aborted {
        /// Index of the wave during which the failure happened.
        wave: usize,
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for stackrecon operations.
pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error belongs to the validation phase
    /// (nothing was sent to the provider).
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_) | Self::Plan(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a store-unavailable error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Returns true if the failure is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. }
                | Self::Timeout { .. }
                | Self::Network { .. }
                | Self::Unavailable { .. }
        )
    }

    /// Returns true if the provider could not be reached at all.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Returns the wait the provider asked for, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after_ms } if *retry_after_ms > 0 => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}
