//! Cloud provider interface.
//!
//! The engine talks to the provider only through [`CloudProvider`]. Two
//! implementations ship with the crate: [`HttpProvider`] for a JSON REST
//! control plane and [`SimulatedProvider`], an in-process provider used by
//! tests and for dry runs.

mod http;
mod retry;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceKind};

pub use http::HttpProvider;
pub use retry::RetryPolicy;
pub use simulated::SimulatedProvider;

/// Result of a single provider call.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A resource as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Provider-assigned identifier.
    #[serde(rename = "id")]
    pub provider_id: String,
    /// Live attribute values.
    #[serde(default)]
    pub attributes: Attributes,
    /// Provider-computed outputs (`arn`, `url`, ...).
    #[serde(default)]
    pub outputs: Attributes,
}

/// Create/read/update/delete against the provider, per resource kind.
///
/// Implementations do not retry; the executor wraps every call in a
/// [`RetryPolicy`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Creates a resource and returns its identity and outputs.
    async fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResource>;

    /// Reads a resource; `Ok(None)` if it no longer exists.
    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> ProviderResult<Option<ProviderResource>>;

    /// Updates a resource in place.
    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResource>;

    /// Deletes a resource.
    async fn delete(&self, kind: ResourceKind, provider_id: &str) -> ProviderResult<()>;
}
