//! Drift detection.
//!
//! Re-reads recorded resources from the provider and compares what is live
//! with what was declared. Reporting only: drift is never corrected here.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::{Result, StackError};
use crate::graph::{OutputRef, ResourceGraph, ResourceKind};
use crate::provider::CloudProvider;
use crate::state::StateSnapshot;

/// Drift found on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDrift {
    /// Logical id.
    pub logical_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider id that was read.
    pub provider_id: String,
    /// Names of declared attributes whose live value differs, sorted.
    pub changed_attributes: Vec<String>,
    /// The resource no longer exists at the provider.
    pub missing: bool,
}

/// Result of a drift check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Number of resources read.
    pub checked: usize,
    /// Resources that diverged.
    pub drifted: Vec<ResourceDrift>,
    /// Resources that could not be read, with the reason.
    pub errors: Vec<(String, String)>,
}

/// Compares live resources with the declared graph.
pub struct DriftReporter<'a> {
    provider: &'a dyn CloudProvider,
}

impl std::fmt::Debug for DriftReporter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftReporter")
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl<'a> DriftReporter<'a> {
    /// Creates a new drift reporter.
    #[must_use]
    pub const fn new(provider: &'a dyn CloudProvider) -> Self {
        Self { provider }
    }

    /// Checks every declared resource that has a record in `snapshot`,
    /// restricted to `scope` when given.
    ///
    /// # Errors
    ///
    /// Returns an error only if the provider cannot be reached at all.
    /// Other read failures are collected in [`DriftReport::errors`].
    pub async fn report(
        &self,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        scope: Option<&HashSet<String>>,
    ) -> Result<DriftReport> {
        let mut report = DriftReport::default();

        for node in graph.iter() {
            if scope.is_some_and(|s| !s.contains(&node.id)) {
                continue;
            }
            let Some(record) = snapshot.get(&node.id) else {
                continue;
            };

            report.checked += 1;
            let live = match self.provider.read(record.kind, &record.provider_id).await {
                Ok(live) => live,
                Err(e) if e.is_unreachable() => return Err(StackError::Provider(e)),
                Err(e) => {
                    warn!("Could not read {}: {e}", node.id);
                    report.errors.push((node.id.clone(), e.to_string()));
                    continue;
                }
            };

            let Some(live) = live else {
                info!("{} is missing at the provider", node.id);
                report.drifted.push(ResourceDrift {
                    logical_id: node.id.clone(),
                    kind: node.kind,
                    provider_id: record.provider_id.clone(),
                    changed_attributes: Vec::new(),
                    missing: true,
                });
                continue;
            };

            let lookup = |r: &OutputRef| snapshot.get(&r.node).and_then(|s| s.output(&r.output));
            let changed: Vec<String> = node
                .attributes
                .iter()
                .filter_map(|(name, declared)| {
                    // Unresolvable references cannot be compared.
                    let expected = declared.resolve(&lookup).ok()?;
                    (live.attributes.get(name) != Some(&expected)).then(|| name.clone())
                })
                .collect();

            if changed.is_empty() {
                debug!("{} matches its declaration", node.id);
            } else {
                info!("{} drifted: {}", node.id, changed.join(", "));
                report.drifted.push(ResourceDrift {
                    logical_id: node.id.clone(),
                    kind: node.kind,
                    provider_id: record.provider_id.clone(),
                    changed_attributes: changed,
                    missing: false,
                });
            }
        }

        Ok(report)
    }
}

impl DriftReport {
    /// Returns true if nothing drifted and nothing failed to read.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty() && self.errors.is_empty()
    }

    /// Looks up the drift for one logical id.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&ResourceDrift> {
        self.drifted.iter().find(|d| d.logical_id == logical_id)
    }
}
