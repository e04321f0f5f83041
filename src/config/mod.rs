//! Configuration module for the reconciliation engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stack.yaml`
//! - Validation of configuration values
//! - Computing fingerprints for plan pinning

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    ExecutionConfig, Lifecycle, OutputConfig, ProviderConfig, ResourceConfig, RetryConfig,
    StackConfig, StackInfo, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
