//! In-process provider.
//!
//! Keeps resources in memory and derives outputs deterministically from
//! attributes. Tests use it to inject faults, count calls and change
//! resources behind the engine's back. The CLI saves its resources to a
//! JSON file between runs so that a stack applied without a real endpoint
//! is still there for the next `drift` or `apply`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, StateError};
use crate::graph::{Attributes, ResourceKind};

use super::{CloudProvider, ProviderResource, ProviderResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimResource {
    logical_id: String,
    kind: ResourceKind,
    attributes: Attributes,
    outputs: Attributes,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SimState {
    /// Provider id to resource.
    resources: HashMap<String, SimResource>,
    /// Queued faults per logical id, consumed one per call.
    #[serde(skip)]
    faults: HashMap<String, VecDeque<ProviderError>>,
    /// Calls seen per logical id.
    #[serde(skip)]
    calls: HashMap<String, u32>,
    /// Source of provider ids.
    next_id: u64,
    /// Published version numbers per function.
    versions: HashMap<String, u64>,
}

/// In-memory provider with fault injection.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    state: Mutex<SimState>,
    latency: Option<Duration>,
    unreachable: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Tracks concurrent calls for the lifetime of one request.
struct InFlight<'a>(&'a SimulatedProvider);

impl<'a> InFlight<'a> {
    fn enter(provider: &'a SimulatedProvider) -> Self {
        let now = provider.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        provider.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(provider)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take at least `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Loads resources written by [`Self::save`]; a missing file gives an
    /// empty provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };

        let state: SimState = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse {}: {e}", path.display()),
        })?;
        debug!(
            "Loaded {} simulated resources from {}",
            state.resources.len(),
            path.display()
        );

        Ok(Self {
            state: Mutex::new(state),
            ..Self::default()
        })
    }

    /// Writes the live resources to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&*self.lock())
            .map_err(|e| StateError::serialization(format!("Failed to serialize resources: {e}")))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        debug!("Saved simulated resources to {}", path.display());
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `times` calls touching `logical_id` with `error`.
    pub fn inject_fault(&self, logical_id: &str, error: ProviderError, times: u32) {
        let mut state = self.lock();
        let queue = state.faults.entry(logical_id.to_string()).or_default();
        queue.extend(std::iter::repeat_n(error, times as usize));
    }

    /// Makes every call fail as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of calls that touched `logical_id`.
    #[must_use]
    pub fn calls(&self, logical_id: &str) -> u32 {
        self.lock().calls.get(logical_id).copied().unwrap_or(0)
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Live attributes of the resource created for `logical_id`.
    #[must_use]
    pub fn live_attributes(&self, logical_id: &str) -> Option<Attributes> {
        self.lock()
            .resources
            .values()
            .find(|r| r.logical_id == logical_id)
            .map(|r| r.attributes.clone())
    }

    /// Changes an attribute without going through the engine.
    pub fn edit_out_of_band(&self, logical_id: &str, attribute: &str, value: Value) -> bool {
        let mut state = self.lock();
        match state.resources.values_mut().find(|r| r.logical_id == logical_id) {
            Some(resource) => {
                resource.attributes.insert(attribute.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Deletes a resource without going through the engine.
    pub fn remove_out_of_band(&self, logical_id: &str) -> bool {
        let mut state = self.lock();
        let before = state.resources.len();
        state.resources.retain(|_, r| r.logical_id != logical_id);
        state.resources.len() != before
    }

    /// Common prologue: latency, reachability, call counting, faults.
    async fn enter(&self, logical_id: &str) -> ProviderResult<InFlight<'_>> {
        let guard = InFlight::enter(self);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProviderError::network("simulated provider unreachable"));
        }

        let mut state = self.lock();
        *state.calls.entry(logical_id.to_string()).or_default() += 1;
        if let Some(fault) = state.faults.get_mut(logical_id).and_then(VecDeque::pop_front) {
            trace!("Injecting fault for {logical_id}: {fault}");
            return Err(fault);
        }
        Ok(guard)
    }

    fn logical_id_of(&self, provider_id: &str) -> String {
        self.lock()
            .resources
            .get(provider_id)
            .map_or_else(|| provider_id.to_string(), |r| r.logical_id.clone())
    }
}

fn not_found(kind: ResourceKind, provider_id: &str) -> ProviderError {
    ProviderError::NotFound {
        kind: kind.to_string(),
        provider_id: provider_id.to_string(),
    }
}

/// Derives the outputs a real control plane would report.
fn compute_outputs(
    state: &mut SimState,
    kind: ResourceKind,
    provider_id: &str,
    logical_id: &str,
    attributes: &Attributes,
) -> Attributes {
    let name = kind
        .name_attribute()
        .and_then(|a| attributes.get(a))
        .and_then(Value::as_str)
        .unwrap_or(logical_id)
        .to_string();
    let arn = format!("arn:sim:{kind}:{name}");

    let mut outputs = Attributes::new();
    match kind {
        ResourceKind::Function
        | ResourceKind::Role
        | ResourceKind::Policy
        | ResourceKind::Table
        | ResourceKind::LogGroup => {
            outputs.insert(String::from("arn"), Value::String(arn));
            outputs.insert(String::from("name"), Value::String(name));
        }
        ResourceKind::ScalingPolicy => {
            outputs.insert(String::from("arn"), Value::String(arn));
        }
        ResourceKind::FunctionVersion => {
            let function = attributes
                .get("function")
                .map(|v| v.as_str().map_or_else(|| v.to_string(), ToString::to_string))
                .unwrap_or_default();
            let version = state.versions.entry(function.clone()).or_default();
            *version += 1;
            outputs.insert(String::from("version"), Value::String(version.to_string()));
            outputs.insert(
                String::from("qualified_arn"),
                Value::String(format!("{function}:{version}")),
            );
        }
        ResourceKind::FunctionUrl => {
            outputs.insert(
                String::from("url"),
                Value::String(format!("https://{provider_id}.lambda-url.sim/")),
            );
        }
        ResourceKind::ScalableTarget | ResourceKind::PermissionGrant => {}
    }
    outputs
}

#[async_trait]
impl CloudProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResource> {
        let _guard = self.enter(logical_id).await?;

        let mut state = self.lock();
        state.next_id += 1;
        let provider_id = format!("{}-{:04}", kind.as_str().replace('_', "-"), state.next_id);
        let outputs = compute_outputs(&mut state, kind, &provider_id, logical_id, attributes);

        state.resources.insert(
            provider_id.clone(),
            SimResource {
                logical_id: logical_id.to_string(),
                kind,
                attributes: attributes.clone(),
                outputs: outputs.clone(),
            },
        );

        Ok(ProviderResource {
            provider_id,
            attributes: attributes.clone(),
            outputs,
        })
    }

    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> ProviderResult<Option<ProviderResource>> {
        let logical_id = self.logical_id_of(provider_id);
        let _guard = self.enter(&logical_id).await?;

        Ok(self
            .lock()
            .resources
            .get(provider_id)
            .filter(|r| r.kind == kind)
            .map(|r| ProviderResource {
                provider_id: provider_id.to_string(),
                attributes: r.attributes.clone(),
                outputs: r.outputs.clone(),
            }))
    }

    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResource> {
        let logical_id = self.logical_id_of(provider_id);
        let _guard = self.enter(&logical_id).await?;

        let mut state = self.lock();
        let resource = state
            .resources
            .get_mut(provider_id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| not_found(kind, provider_id))?;
        resource.attributes = attributes.clone();

        Ok(ProviderResource {
            provider_id: provider_id.to_string(),
            attributes: resource.attributes.clone(),
            outputs: resource.outputs.clone(),
        })
    }

    async fn delete(&self, kind: ResourceKind, provider_id: &str) -> ProviderResult<()> {
        let logical_id = self.logical_id_of(provider_id);
        let _guard = self.enter(&logical_id).await?;

        self.lock()
            .resources
            .remove(provider_id)
            .map(|_| ())
            .ok_or_else(|| not_found(kind, provider_id))
    }
}
