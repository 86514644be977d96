mod diagnose;
mod lifecycle;
mod logs;
mod models;
mod ports;
mod serve;
mod session;
mod status;
mod validate;

pub use diagnose::run_diagnose;
pub use lifecycle::{run_delete, run_start, run_stop};
pub use logs::run_logs;
pub use models::run_models;
pub use ports::{run_discover, run_ports};
pub use serve::run_serve;
pub use session::{run_activate, run_session};
pub use status::{run_reconcile, run_status};
pub use validate::{run_hosts, run_validate};
