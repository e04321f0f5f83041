//! Resource graph module.
//!
//! This module turns the declared resources of a stack into a validated
//! directed acyclic graph with explicit dependency edges.

mod builder;
mod kind;
mod node;

pub use builder::{GraphBuilder, ResourceGraph, StackOutput};
pub use kind::ResourceKind;
pub use node::{AttrValue, Attributes, OutputRef, ResourceNode, TemplatePart};
