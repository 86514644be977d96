//! Service configuration types.
//!
//! This module contains the [`ServiceSpec`] struct: the desired launch
//! parameters of one inference server on one host.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Environment names that mean "no activation, use a bare interpreter".
pub const BARE_INTERPRETERS: &[&str] = &["system-python", "python3", "python"];

/// Environment name for images that ship the server preinstalled.
pub const BUILTIN_ENVIRONMENT: &str = "vllm-builtin";

/// Desired launch parameters for a managed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service identity.
    #[serde(alias = "name")]
    pub id: String,

    /// Name of the `RemoteHost` the service runs on.
    pub host: String,

    /// Model directory or hub identifier passed to `--model`.
    #[serde(alias = "model")]
    pub model_path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_indices: Vec<u32>,

    #[serde(default = "default_tensor_parallel")]
    pub tensor_parallel_size: u32,

    #[serde(default = "default_memory_fraction")]
    pub gpu_memory_utilization: f32,

    #[serde(default = "default_max_model_len")]
    pub max_model_len: u32,

    /// Target environment: a conda env name, an absolute env path, or a
    /// bare interpreter marker such as `system-python`.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "conda_env")]
    pub environment: Option<String>,

    /// Extra server flags, `snake_case` keys become `--kebab-case` options.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_flags: BTreeMap<String, FlagValue>,
}

fn default_tensor_parallel() -> u32 {
    1
}
fn default_memory_fraction() -> f32 {
    0.9
}
fn default_max_model_len() -> u32 {
    4096
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, host: impl Into<String>, model_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            model_path: model_path.into(),
            gpu_indices: Vec::new(),
            tensor_parallel_size: default_tensor_parallel(),
            gpu_memory_utilization: default_memory_fraction(),
            max_model_len: default_max_model_len(),
            environment: None,
            extra_flags: BTreeMap::new(),
        }
    }

    pub fn environment_kind(&self) -> EnvironmentKind {
        EnvironmentKind::classify(self.environment.as_deref())
    }
}

/// Extra flag keys become `--key` options on a remote shell line, so only
/// ASCII letters, digits, `_` and `-` are accepted.
pub fn is_valid_flag_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('-')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// How a service's target environment is reached on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentKind {
    /// A bare interpreter; nothing to activate.
    Bare,
    /// The server is installed system-wide; run the bundled interpreter.
    Builtin,
    /// A named or path-addressed conda environment.
    Named(String),
}

impl EnvironmentKind {
    pub fn classify(env: Option<&str>) -> Self {
        match env.map(str::trim) {
            None | Some("") => EnvironmentKind::Bare,
            Some(name) if BARE_INTERPRETERS.contains(&name) => EnvironmentKind::Bare,
            Some(BUILTIN_ENVIRONMENT) => EnvironmentKind::Builtin,
            Some(name) => EnvironmentKind::Named(name.to_string()),
        }
    }

    /// Whether the environment needs activation in a shell.
    pub fn is_trivial(&self) -> bool {
        !matches!(self, EnvironmentKind::Named(_))
    }
}

/// Value of an extra server flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{}", b),
            FlagValue::Int(i) => write!(f, "{}", i),
            FlagValue::Float(x) => write!(f, "{}", x),
            FlagValue::Text(s) => write!(f, "{}", s),
        }
    }
}
