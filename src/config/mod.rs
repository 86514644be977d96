//! Configuration parsing and types.
//!
//! This module provides the configuration system for fleet-serve,
//! organized into focused submodules:
//!
//! - `types` - Root config structure (`Config`) and tuning sections
//! - `host` - Remote host descriptors (`RemoteHost`)
//! - `service` - Desired launch parameters (`ServiceSpec`, `FlagValue`)
//! - `duration` - Human-readable durations
//! - `parser` - YAML config loading
//! - `validation` - Config validation

mod duration;
mod host;
mod parser;
mod service;
mod types;
mod validation;

pub use duration::*;
pub use host::*;
pub use parser::*;
pub use service::*;
pub use types::*;
