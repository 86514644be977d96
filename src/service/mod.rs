//! Managed inference servers.
//!
//! - [`types`]: the per-service state machine ([`Status`], [`StateTransition`])
//!   and the [`ManagedService`] record
//! - [`command`]: launch command construction for session and one-shot paths
//! - [`pid`]: ordered pid recovery strategies
//! - [`remote`]: liveness, port and signal probes run on the host
//!
//! # Example
//!
//! ```
//! use fleet_serve::service::{ManagedService, StateTransition, Status};
//! use fleet_serve::config::ServiceSpec;
//!
//! let mut svc = ManagedService::new(ServiceSpec::new("qwen", "gpu-a", "/models/qwen"));
//! let t = StateTransition::starting();
//! t.validate(svc.id(), svc.status).unwrap();
//! t.apply(&mut svc);
//! assert_eq!(svc.status, Status::Starting);
//! ```

pub mod command;
pub mod pid;
pub mod remote;
mod types;

pub use command::LaunchPlan;
pub use pid::{default_strategies, resolve_pid, PidContext, PidStrategy};
pub use remote::{CommandRoute, DiscoveredServer, RemoteProcess};
pub use types::*;
