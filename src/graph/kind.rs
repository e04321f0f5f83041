//! Resource kinds and their per-kind rules.

use serde::{Deserialize, Serialize};

/// The kinds of resource the engine knows how to reconcile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Serverless compute function.
    Function,
    /// Execution role.
    Role,
    /// Permission policy attached to a role.
    Policy,
    /// Key-value table.
    Table,
    /// Autoscaling target for a table dimension.
    ScalableTarget,
    /// Target-tracking scaling policy.
    ScalingPolicy,
    /// Log group.
    LogGroup,
    /// Invoke permission on a function.
    PermissionGrant,
    /// Immutable published version of a function.
    FunctionVersion,
    /// Public URL for a function.
    FunctionUrl,
}

impl ResourceKind {
    /// Every kind, in a fixed order.
    pub const ALL: [Self; 10] = [
        Self::Function,
        Self::Role,
        Self::Policy,
        Self::Table,
        Self::ScalableTarget,
        Self::ScalingPolicy,
        Self::LogGroup,
        Self::PermissionGrant,
        Self::FunctionVersion,
        Self::FunctionUrl,
    ];

    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Role => "role",
            Self::Policy => "policy",
            Self::Table => "table",
            Self::ScalableTarget => "scalable_target",
            Self::ScalingPolicy => "scaling_policy",
            Self::LogGroup => "log_group",
            Self::PermissionGrant => "permission_grant",
            Self::FunctionVersion => "function_version",
            Self::FunctionUrl => "function_url",
        }
    }

    /// Attributes whose change cannot be applied in place.
    #[must_use]
    pub const fn replacement_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Table => &["table_name", "partition_key", "sort_key"],
            Self::Function => &["function_name"],
            Self::Role => &["role_name", "path", "assumed_by"],
            Self::Policy => &["policy_name"],
            Self::LogGroup => &["log_group_name"],
            Self::ScalableTarget => &["resource_id", "scalable_dimension", "service_namespace"],
            Self::ScalingPolicy => &["policy_name", "scaling_target"],
            Self::PermissionGrant => &["function", "principal", "action"],
            Self::FunctionUrl => &["function"],
            // Versions are immutable; see `requires_replacement`.
            Self::FunctionVersion => &[],
        }
    }

    /// Returns true if changing `attribute` forces destroy-and-recreate.
    #[must_use]
    pub fn requires_replacement(self, attribute: &str) -> bool {
        matches!(self, Self::FunctionVersion) || self.replacement_attributes().contains(&attribute)
    }

    /// Attributes that must be declared for this kind.
    #[must_use]
    pub const fn required_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Function => &["function_name", "runtime", "handler", "code", "role"],
            Self::Role => &["role_name", "assumed_by"],
            Self::Policy => &["policy_name", "statements"],
            Self::Table => &["table_name", "partition_key"],
            Self::ScalableTarget => &[
                "resource_id",
                "scalable_dimension",
                "service_namespace",
                "min_capacity",
                "max_capacity",
            ],
            Self::ScalingPolicy => &["policy_name", "scaling_target", "target_value"],
            Self::LogGroup => &["log_group_name"],
            Self::PermissionGrant => &["function", "principal", "action"],
            Self::FunctionVersion => &["function"],
            Self::FunctionUrl => &["function", "auth_type"],
        }
    }

    /// Outputs the provider reports for this kind, besides `id`.
    #[must_use]
    pub const fn output_names(self) -> &'static [&'static str] {
        match self {
            Self::Function | Self::Role | Self::Policy | Self::Table | Self::LogGroup => {
                &["arn", "name"]
            }
            Self::ScalingPolicy => &["arn"],
            Self::ScalableTarget | Self::PermissionGrant => &[],
            Self::FunctionVersion => &["version", "qualified_arn"],
            Self::FunctionUrl => &["url"],
        }
    }

    /// The attribute carrying the resource's user-facing name, if any.
    #[must_use]
    pub const fn name_attribute(self) -> Option<&'static str> {
        match self {
            Self::Function => Some("function_name"),
            Self::Role => Some("role_name"),
            Self::Policy | Self::ScalingPolicy => Some("policy_name"),
            Self::Table => Some("table_name"),
            Self::LogGroup => Some("log_group_name"),
            _ => None,
        }
    }

    /// Returns true if `output` is something this kind reports.
    #[must_use]
    pub fn has_output(self, output: &str) -> bool {
        output == "id" || self.output_names().contains(&output)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
