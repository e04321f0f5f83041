//! Configuration validation for stack documents.
//!
//! Range checks on numeric settings come from the `validator` derive on the
//! document types; everything that needs to look across fields or resources
//! lives here.

use crate::error::{ConfigError, Result, StackError};
use crate::graph::{AttrValue, ResourceKind};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::spec::{ExecutionConfig, ResourceConfig, StackConfig, StateBackend, StateConfig};

/// Validator for stack documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackError::Config(ConfigError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            )))
        }
    }

    /// Runs every check and collects all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            flatten_derive_errors("", &errors, &mut result);
        }

        Self::validate_stack(config, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    fn validate_stack(config: &StackConfig, result: &mut ValidationResult) {
        if config.stack.name.is_empty() {
            result.error("stack.name", "Stack name cannot be empty");
        } else if !is_valid_name(&config.stack.name) {
            result.error(
                "stack.name",
                format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.stack.name
                ),
            );
        }

        if config.stack.environment.is_empty() {
            result.error("stack.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        let retry = execution.retry;
        if retry.base_delay_ms > retry.max_delay_ms {
            result.error(
                "execution.retry.base_delay_ms",
                format!(
                    "Base delay {}ms exceeds max delay {}ms",
                    retry.base_delay_ms, retry.max_delay_ms
                ),
            );
        }
    }

    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let kinds: HashMap<&str, ResourceKind> = config
            .resources
            .iter()
            .map(|r| (r.id.as_str(), r.kind))
            .collect();
        let mut seen_ids = HashSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_ids.insert(resource.id.as_str()) {
                result.error(
                    format!("{prefix}.id"),
                    format!("Duplicate resource id: {}", resource.id),
                );
            }

            if !is_valid_id(&resource.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!(
                        "Resource id '{}' is invalid. Must start with a letter and contain only letters, digits, '_' or '-'.",
                        resource.id
                    ),
                );
            }

            for required in resource.kind.required_attributes() {
                if !resource.attributes.contains_key(*required) {
                    result.error(
                        format!("{prefix}.attributes.{required}"),
                        format!(
                            "Resource '{}' of kind {} requires attribute '{required}'",
                            resource.id, resource.kind
                        ),
                    );
                }
            }

            for dep in &resource.depends_on {
                if !kinds.contains_key(dep.as_str()) {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("Resource '{}' depends on unknown resource '{dep}'", resource.id),
                    );
                }
            }

            Self::validate_references(resource, &prefix, &kinds, result);
            Self::validate_kind_rules(resource, &prefix, result);
        }
    }

    fn validate_references(
        resource: &ResourceConfig,
        prefix: &str,
        kinds: &HashMap<&str, ResourceKind>,
        result: &mut ValidationResult,
    ) {
        for (name, raw) in &resource.attributes {
            let field = format!("{prefix}.attributes.{name}");
            let parsed = match AttrValue::parse(raw) {
                Ok(parsed) => parsed,
                Err(expression) => {
                    result.error(field, format!("Malformed reference: {expression}"));
                    continue;
                }
            };

            for reference in parsed.references() {
                match kinds.get(reference.node.as_str()) {
                    None => result.error(
                        field.clone(),
                        format!("Reference to unknown resource '{}'", reference.node),
                    ),
                    Some(kind) if !kind.has_output(&reference.output) => {
                        result.warnings.push(format!(
                            "{field}: {kind} '{}' does not report output '{}'",
                            reference.node, reference.output
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Per-kind checks on literal attribute values.
    fn validate_kind_rules(resource: &ResourceConfig, prefix: &str, result: &mut ValidationResult) {
        let number = |key: &str| resource.attributes.get(key).and_then(Value::as_f64);

        match resource.kind {
            ResourceKind::ScalableTarget => {
                if let (Some(min), Some(max)) = (number("min_capacity"), number("max_capacity")) {
                    if min < 0.0 {
                        result.error(
                            format!("{prefix}.attributes.min_capacity"),
                            "Minimum capacity cannot be negative",
                        );
                    }
                    if min > max {
                        result.error(
                            format!("{prefix}.attributes.min_capacity"),
                            format!("Minimum capacity {min} exceeds maximum capacity {max}"),
                        );
                    }
                }
            }
            ResourceKind::ScalingPolicy => {
                if let Some(target) = number("target_value")
                    && (target <= 0.0 || target > 100.0)
                {
                    result.error(
                        format!("{prefix}.attributes.target_value"),
                        format!("Target utilization {target} must be in (0, 100]"),
                    );
                }
            }
            ResourceKind::Function => {
                if let Some(memory) = number("memory_size")
                    && !(128.0..=10_240.0).contains(&memory)
                {
                    result.error(
                        format!("{prefix}.attributes.memory_size"),
                        format!("Memory size {memory} must be between 128 and 10240 MB"),
                    );
                }
                if let Some(timeout) = number("timeout")
                    && !(1.0..=900.0).contains(&timeout)
                {
                    result.error(
                        format!("{prefix}.attributes.timeout"),
                        format!("Timeout {timeout} must be between 1 and 900 seconds"),
                    );
                }
            }
            ResourceKind::FunctionUrl => {
                if let Some(auth) = resource.attributes.get("auth_type").and_then(Value::as_str)
                    && auth.eq_ignore_ascii_case("none")
                {
                    result.warnings.push(format!(
                        "{prefix}.attributes.auth_type: function URL '{}' is publicly invocable",
                        resource.id
                    ));
                }
            }
            _ => {}
        }
    }

    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        for (name, output) in &config.outputs {
            let field = format!("outputs.{name}");
            match AttrValue::parse(&output.value) {
                Err(expression) => result.error(field, format!("Malformed reference: {expression}")),
                Ok(parsed) => {
                    for reference in parsed.references() {
                        if config.resource(&reference.node).is_none() {
                            result.error(
                                field.clone(),
                                format!("Reference to unknown resource '{}'", reference.node),
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Flattens errors from the `validator` derive into dotted field paths.
fn flatten_derive_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    for (field, kind) in errors.errors() {
        let path = format!("{prefix}{field}");
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| format!("failed '{}' check", error.code), ToString::to_string);
                    result.error(path.clone(), message);
                }
            }
            ValidationErrorsKind::Struct(inner) => {
                flatten_derive_errors(&format!("{path}."), inner, result);
            }
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    flatten_derive_errors(&format!("{path}[{index}]."), inner, result);
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Logical ids: a letter, then letters, digits, `_` or `-`.
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} error(s), {} warning(s)",
            self.error_count(),
            self.warning_count()
        )?;
        for error in &self.errors {
            write!(f, "\n  error: {error}")?;
        }
        for warning in &self.warnings {
            write!(f, "\n  warning: {warning}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parse")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("avlambda"));
        assert!(is_valid_name("control-center-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Stack"));
        assert!(!is_valid_name("stack-"));
        assert!(!is_valid_name("a--b"));
    }

    #[test]
    fn test_valid_id() {
        assert!(is_valid_id("exec_role"));
        assert!(is_valid_id("readScalingPolicy"));
        assert!(!is_valid_id("1role"));
        assert!(!is_valid_id("role.arn"));
    }

    #[test]
    fn test_missing_required_attribute() {
        let config = parse(
            r"
stack:
  name: test
resources:
  - id: stats
    kind: table
    attributes:
      table_name: stats
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "resources[0].attributes.partition_key"));

        let text = result.to_string();
        assert!(text.starts_with("1 error(s), 0 warning(s)"));
        assert!(text.contains("error: resources[0].attributes.partition_key: "));
    }

    #[test]
    fn test_capacity_bounds() {
        let config = parse(
            r"
stack:
  name: test
resources:
  - id: read_target
    kind: scalable_target
    attributes:
      resource_id: table/stats
      scalable_dimension: dynamodb:table:ReadCapacityUnits
      service_namespace: dynamodb
      min_capacity: 30
      max_capacity: 20
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("exceeds maximum"));
    }

    #[test]
    fn test_derive_range_errors_are_reported() {
        let config = parse(
            r"
stack:
  name: test
execution:
  max_parallelism: 0
",
        );
        let err = ConfigValidator::new().validate(&config).expect_err("invalid");
        assert!(err.is_validation());
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "execution.max_parallelism"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse("stack:\n  name: test\nstate:\n  backend: s3\n");
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "state.bucket"));
    }

    #[test]
    fn test_unknown_output_is_a_warning() {
        let config = parse(
            r"
stack:
  name: test
resources:
  - id: logs
    kind: log_group
    attributes:
      log_group_name: /aws/lambda/fn
  - id: grant
    kind: permission_grant
    attributes:
      function: ref(logs, url)
      principal: '*'
      action: lambda:InvokeFunctionUrl
",
        );
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("does not report output 'url'"));
    }
}
