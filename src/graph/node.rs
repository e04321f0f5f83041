//! Resource nodes and declared attribute values.
//!
//! Attribute values are parsed once, at graph-build time, into [`AttrValue`].
//! A value is either a plain literal or contains references to other
//! resources' outputs, written as `ref(id, output)` for a whole value or
//! `${ref(id, output)}` inside a string. Any other `${...}` is left as text
//! for the provider, and `$${` writes a literal `${`.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::Lifecycle;

use super::kind::ResourceKind;

/// Attribute snapshot: name to concrete value.
pub type Attributes = BTreeMap<String, Value>;

/// A reference to another resource's output attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Logical id of the referenced resource.
    pub node: String,
    /// Name of the referenced output.
    pub output: String,
}

/// A segment of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Literal text.
    Text(String),
    /// Interpolated output reference.
    Ref(OutputRef),
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// A value with no references.
    Literal(Value),
    /// A whole-value reference.
    Ref(OutputRef),
    /// A string with embedded references.
    Template(Vec<TemplatePart>),
    /// A list containing at least one reference.
    List(Vec<AttrValue>),
    /// A map containing at least one reference.
    Map(BTreeMap<String, AttrValue>),
}

/// A single resource in the desired-state graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Logical id, unique within the graph.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Explicit and implicit dependencies.
    pub depends_on: BTreeSet<String>,
    /// Lifecycle options.
    pub lifecycle: Lifecycle,
    /// Position in the source document.
    pub index: usize,
}

impl OutputRef {
    /// Parses the inside of `ref(...)`, e.g. `role, arn`.
    fn parse_args(args: &str) -> Option<Self> {
        let mut parts = args.split(',').map(str::trim);
        let node = parts.next()?;
        let output = parts.next()?;
        if parts.next().is_some() || !is_identifier(node) || !is_identifier(output) {
            return None;
        }
        Some(Self {
            node: node.to_string(),
            output: output.to_string(),
        })
    }

    /// Parses a whole `ref(id, output)` expression.
    fn parse_expression(expr: &str) -> Option<Self> {
        expr.trim()
            .strip_prefix("ref(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(Self::parse_args)
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ref({}, {})", self.node, self.output)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl AttrValue {
    /// Parses a raw document value.
    ///
    /// # Errors
    ///
    /// Returns the offending expression if a reference is malformed.
    pub fn parse(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::String(s) => Self::parse_string(s),
            Value::Array(items) => {
                let parsed = items
                    .iter()
                    .map(Self::parse)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                match parsed.iter().map(Self::as_literal).collect::<Option<Vec<_>>>() {
                    Some(items) => Ok(Self::Literal(Value::Array(items))),
                    None => Ok(Self::List(parsed)),
                }
            }
            Value::Object(map) => {
                let parsed = map
                    .iter()
                    .map(|(k, v)| Self::parse(v).map(|p| (k.clone(), p)))
                    .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
                let literal = parsed
                    .iter()
                    .map(|(k, v)| v.as_literal().map(|v| (k.clone(), v)))
                    .collect::<Option<serde_json::Map<_, _>>>();
                match literal {
                    Some(map) => Ok(Self::Literal(Value::Object(map))),
                    None => Ok(Self::Map(parsed)),
                }
            }
            _ => Ok(Self::Literal(value.clone())),
        }
    }

    fn parse_string(s: &str) -> std::result::Result<Self, String> {
        let trimmed = s.trim();
        if trimmed.starts_with("ref(") {
            return OutputRef::parse_expression(trimmed)
                .map(Self::Ref)
                .ok_or_else(|| s.to_string());
        }
        if !s.contains("${") {
            return Ok(Self::Literal(Value::String(s.to_string())));
        }

        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            // `$${` is a literal `${`.
            if rest[..start].ends_with('$') {
                text.push_str(&rest[..start - 1]);
                text.push_str("${");
                rest = &rest[start + 2..];
                continue;
            }

            text.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            if !after.trim_start().starts_with("ref(") {
                // Provider-side placeholders such as `${aws:username}`.
                text.push_str("${");
                rest = after;
                continue;
            }

            let end = after.find('}').ok_or_else(|| s.to_string())?;
            let reference =
                OutputRef::parse_expression(&after[..end]).ok_or_else(|| s.to_string())?;
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            parts.push(TemplatePart::Ref(reference));
            rest = &after[end + 1..];
        }
        text.push_str(rest);

        if parts.is_empty() {
            return Ok(Self::Literal(Value::String(text)));
        }
        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        Ok(Self::Template(parts))
    }

    /// Returns true if the value contains no references.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    fn as_literal(&self) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Collects every reference in the value.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => out.push(r),
            Self::Template(parts) => out.extend(parts.iter().filter_map(|p| match p {
                TemplatePart::Ref(r) => Some(r),
                TemplatePart::Text(_) => None,
            })),
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(out)),
        }
    }

    /// Resolves the value, looking references up with `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` could not answer.
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<Value, OutputRef>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Ref(r) => lookup(r).ok_or_else(|| r.clone()),
            Self::Template(parts) => {
                let mut s = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(t) => s.push_str(t),
                        TemplatePart::Ref(r) => {
                            let v = lookup(r).ok_or_else(|| r.clone())?;
                            match v {
                                Value::String(text) => s.push_str(&text),
                                other => s.push_str(&other.to_string()),
                            }
                        }
                    }
                }
                Ok(Value::String(s))
            }
            Self::List(items) => items
                .iter()
                .map(|i| i.resolve(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|r| (k.clone(), r)))
                .collect::<std::result::Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
        }
    }
}

impl ResourceNode {
    /// Every output reference made by this node's attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        self.attributes.values().flat_map(AttrValue::references).collect()
    }

    /// Resolves all attributes.
    ///
    /// # Errors
    ///
    /// Returns the first reference that could not be resolved.
    pub fn resolve_attributes<F>(&self, lookup: &F) -> std::result::Result<Attributes, OutputRef>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        self.attributes
            .iter()
            .map(|(k, v)| v.resolve(lookup).map(|r| (k.clone(), r)))
            .collect()
    }
}
