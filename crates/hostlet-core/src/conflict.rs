//! Configuration-time detection of devices declared by more than one cluster
//!
//! Everything here is derived from configuration alone and never touches the
//! ledger.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::device::PciAddress;

/// Device address to the clusters that declare it
pub type DeviceUsage = BTreeMap<PciAddress, Vec<String>>;

/// A device declared by more than one VM of the same cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateDevice {
    pub cluster: String,
    pub device: PciAddress,
    /// VMs declaring the device, in declaration order
    pub vms: Vec<String>,
}

/// GPU topology across all clusters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceSummary {
    /// Every declared GPU
    pub all: DeviceUsage,
    /// GPUs declared by two or more clusters
    pub shared: DeviceUsage,
    /// GPUs declared by exactly one cluster
    pub exclusive: DeviceUsage,
}

fn gpu_usage(clusters: &[ClusterConfig]) -> DeviceUsage {
    let mut usage = DeviceUsage::new();

    for cluster in clusters {
        for vm in &cluster.vms {
            let Some(device) = vm.device.as_ref().filter(|d| d.is_gpu()) else {
                continue;
            };
            let users = usage.entry(device.pci_address.clone()).or_default();
            if !users.contains(&cluster.name) {
                users.push(cluster.name.clone());
            }
        }
    }

    usage
}

/// Find GPUs referenced by more than one cluster
pub fn detect_shared_devices(clusters: &[ClusterConfig]) -> DeviceUsage {
    let shared: DeviceUsage = gpu_usage(clusters)
        .into_iter()
        .filter(|(_, users)| users.len() > 1)
        .collect();

    if !shared.is_empty() {
        debug!(count = shared.len(), "Detected shared devices");
    }

    shared
}

/// Find devices declared more than once within a single cluster
pub fn find_duplicate_devices(cluster: &ClusterConfig) -> Vec<DuplicateDevice> {
    let mut by_device: BTreeMap<&PciAddress, Vec<String>> = BTreeMap::new();

    for vm in &cluster.vms {
        if let Some(device) = &vm.device {
            by_device
                .entry(&device.pci_address)
                .or_default()
                .push(vm.name.clone());
        }
    }

    by_device
        .into_iter()
        .filter(|(_, vms)| vms.len() > 1)
        .map(|(device, vms)| DuplicateDevice {
            cluster: cluster.name.clone(),
            device: device.clone(),
            vms,
        })
        .collect()
}

/// Summarize GPU usage as all, shared and exclusive devices
pub fn device_summary(clusters: &[ClusterConfig]) -> DeviceSummary {
    let all = gpu_usage(clusters);
    let (shared, exclusive) = all
        .clone()
        .into_iter()
        .partition(|(_, users)| users.len() > 1);

    DeviceSummary {
        all,
        shared,
        exclusive,
    }
}
