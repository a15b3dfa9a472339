//! Configuration module for the compute engine
//!
//! Supports a YAML configuration file with `LOCALFN_*` environment overrides
//! applied on top, followed by validation.

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::*;
pub use types::*;
