// ============================================================================
// Linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # stackrecon
//!
//! A declarative provisioning reconciliation engine for serverless stacks.
//!
//! ## Overview
//!
//! A stack document declares resources (functions, roles, policies, tables,
//! autoscaling targets and policies, log groups, permission grants, function
//! versions and URLs) and the references between them. Each run:
//!
//! 1. **Graph**: builds a validated dependency graph from the document
//! 2. **Diff**: compares it with the recorded state of the last apply
//! 3. **Schedule**: orders the changes into waves of independent steps
//! 4. **Execute**: applies the waves against the provider, in parallel
//!    within a wave, with bounded retries for transient failures
//! 5. **Drift**: re-reads what was touched and reports divergence
//!
//! ## Modules
//!
//! - [`config`]: Stack document parsing, validation and hashing
//! - [`graph`]: Resource graph construction
//! - [`state`]: State storage backends (local, S3, memory)
//! - [`provider`]: Cloud provider interface and implementations
//! - [`planner`]: Diffing, scheduling and execution
//! - [`drift`]: Drift detection
//! - [`reconciler`]: One plan/apply cycle
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: avlambda
//!   environment: prod
//!
//! resources:
//!   - id: role
//!     kind: role
//!     attributes:
//!       role_name: avlambda-prod-lambdaRole
//!       assumed_by: lambda.amazonaws.com
//!   - id: function
//!     kind: function
//!     attributes:
//!       function_name: avlambda-prod-function
//!       runtime: nodejs20.x
//!       handler: index.handler
//!       code: dist/function.zip
//!       role: ref(role, arn)
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod drift;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use drift::{DriftReport, DriftReporter, ResourceDrift};
pub use error::{Result, StackError};
pub use graph::{GraphBuilder, ResourceGraph, ResourceKind};
pub use planner::{
    CancelToken, ChangeSet, DiffEngine, ExecutionPlan, ExecutionResult, PlanExecutor,
    PlanScheduler,
};
pub use provider::{CloudProvider, HttpProvider, RetryPolicy, SimulatedProvider};
pub use reconciler::{ApplyReport, PlannedRun, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
