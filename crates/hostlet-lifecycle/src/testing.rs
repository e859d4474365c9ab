//! Shared fixtures for unit tests

use hostlet_core::{
    Device, HostConfig, Owner, PciAddress, VmConfig, VmDescriptor,
};
use hostlet_ledger::{Ledger, ResourceAllocator};
use hostlet_runtime::{Hypervisor, SimulatedHypervisor};
use std::sync::Arc;
use tempfile::TempDir;

use crate::cluster::ClusterManager;
use crate::system::SystemCoordinator;
use crate::vm::VmCoordinator;

pub const HOST_CONFIG: &str = r#"
[hypervisor]
kind = "simulated"

[[clusters]]
name = "hpc"
role = "training"

[[clusters.vms]]
name = "hpc-controller"

[[clusters.vms]]
name = "hpc-compute-01"
[clusters.vms.device]
pci_address = "0000:01:00.0"

[[clusters.vms]]
name = "hpc-compute-02"
[clusters.vms.device]
pci_address = "0000:02:00.0"

[[clusters]]
name = "cloud"
role = "inference"

[[clusters.vms]]
name = "cloud-controller"

[[clusters.vms]]
name = "cloud-gpu-worker-01"
auto_start = false
[clusters.vms.device]
pci_address = "0000:01:00.0"
"#;

pub struct Fixture {
    _dir: TempDir,
    pub hypervisor: Arc<SimulatedHypervisor>,
    pub allocator: ResourceAllocator,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let allocator = ResourceAllocator::new(Ledger::new(dir.path().join("ledger.json")));
        Self {
            _dir: dir,
            hypervisor: Arc::new(SimulatedHypervisor::new()),
            allocator,
        }
    }

    pub fn dyn_hypervisor(&self) -> Arc<dyn Hypervisor> {
        self.hypervisor.clone()
    }

    pub fn coordinator(&self) -> VmCoordinator {
        VmCoordinator::new(self.dyn_hypervisor(), self.allocator.clone())
    }

    pub fn config(&self) -> HostConfig {
        HostConfig::from_toml_str(HOST_CONFIG).unwrap()
    }

    pub fn cluster(&self, name: &str) -> ClusterManager {
        let config = self.config().cluster(name).unwrap().clone();
        ClusterManager::new(config, self.coordinator())
    }

    pub fn system(&self) -> SystemCoordinator {
        SystemCoordinator::new(self.config(), self.coordinator()).unwrap()
    }

    pub fn holder(&self, device: &str) -> Option<Owner> {
        self.allocator
            .owner_of(&addr(device))
            .unwrap()
            .map(|entry| entry.owner)
    }
}

pub fn addr(s: &str) -> PciAddress {
    s.parse().unwrap()
}

pub fn descriptor(name: &str, cluster: &str, device: Option<&str>, auto_start: bool) -> VmDescriptor {
    VmConfig {
        name: name.to_string(),
        cpu_cores: 2,
        memory_gb: 4,
        disk_gb: 20,
        auto_start,
        domain_xml: None,
        device: device.map(|d| Device::gpu(addr(d))),
    }
    .descriptor(cluster)
}
