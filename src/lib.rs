//! # fleet-serve
//!
//! Drives inference servers on a fleet of remote GPU hosts over SSH, with
//! no agent on the hosts.
//!
//! ## Features
//!
//! - **Pooled command channel**: one-shot remote commands over reused SSH connections
//! - **Persistent sessions**: one long-lived shell per host, with privilege
//!   escalation and a detachable job container for launched servers
//! - **Environment activation**: conda activation verified through independent
//!   shell signals and cached with a TTL
//! - **Port allocation**: per-host cursors over a configured range, checked
//!   against what is actually bound on the host
//! - **Service lifecycle**: STOPPED → STARTING → RUNNING → STOPPING with a
//!   bounded health wait, graceful-then-forced stop and periodic reconciliation
//!
//! ## Quick Start
//!
//! ```no_run
//! use fleet_serve::{Orchestrator, Parser};
//!
//! # async fn example() -> Result<(), fleet_serve::Error> {
//! let parser = Parser::new();
//! let config = parser.load_config("fleet.yaml")?;
//!
//! let orchestrator = Orchestrator::builder().config(config).build().await?;
//!
//! let outcome = orchestrator.start_service("qwen-7b").await;
//! if outcome.ok {
//!     let snapshot = orchestrator.get_status("qwen-7b")?;
//!     println!("listening on port {:?}", snapshot.port);
//! }
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - One start or stop per service at a time; a second one fails fast
//! - One command at a time per host session; hosts never wait on each other
//! - Health waits are cancellable via [`Orchestrator::cancel_operations`]

pub mod activation;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod port;
pub mod service;
pub mod session;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, Parser, RemoteHost, ServiceSpec};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OperationOutcome, StopTarget};
pub use service::{ManagedService, Status};
