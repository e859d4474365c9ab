//! hostlet-lifecycle: Lifecycle coordination for hostlet
//!
//! This crate drives VMs, clusters and the whole system through their
//! lifecycles while keeping the device ledger consistent:
//! - Per-VM start/stop/restart with device allocation
//! - Per-cluster start/stop/destroy with rollback
//! - Ordered system start/stop, status aggregation and ledger reconciliation

pub mod cluster;
pub mod reconcile;
pub mod rollback;
pub mod status;
pub mod system;
pub mod vm;

pub use cluster::ClusterManager;
pub use reconcile::{find_inconsistencies, Inconsistency};
pub use rollback::{Compensation, Compensations};
pub use status::{ClusterSummary, SystemHealth, SystemStatus, VmSummary};
pub use system::SystemCoordinator;
pub use vm::VmCoordinator;

#[cfg(test)]
mod testing;
