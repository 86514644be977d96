//! Port allocation and remote port inspection.

mod allocator;
pub mod owners;

pub use allocator::{PortAllocator, PortLease, PortProbe, RemoteProbe};
pub use owners::{PortUsage, ProcessInfo};
