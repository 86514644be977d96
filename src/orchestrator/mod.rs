mod builder;
mod core;
mod diagnostics;
mod health;
mod hosts;
mod lifecycle;
mod models;
mod monitoring;

pub use builder::OrchestratorBuilder;
pub use core::*;
pub use diagnostics::{parse_gpus, parse_listening_ports, GpuInfo, HostDiagnosis};
pub use hosts::HostRegistry;
pub use lifecycle::{Credentials, OperationOutcome, StopReport, StopTarget};
pub use models::{find_command, parse_du_megabytes, parse_model_dirs, ModelInfo, ModelKind};
pub use monitoring::ReconcileReport;
