//! hostlet-runtime: Hypervisor abstraction layer
//!
//! This crate provides the hypervisor implementations VMs are driven through:
//! - libvirt through the `virsh` command line
//! - An in-memory simulated hypervisor for dry runs and tests

pub mod simulated;
pub mod traits;
pub mod virsh;

pub use simulated::{HypervisorCall, SimulatedHypervisor};
pub use traits::Hypervisor;
pub use virsh::VirshHypervisor;

use hostlet_core::{HypervisorConfig, HypervisorKind};
use std::sync::Arc;

/// Create the hypervisor selected in configuration
pub fn from_config(config: &HypervisorConfig) -> Arc<dyn Hypervisor> {
    match config.kind {
        HypervisorKind::Virsh => Arc::new(VirshHypervisor::new(config.clone())),
        HypervisorKind::Simulated => Arc::new(SimulatedHypervisor::new()),
    }
}
