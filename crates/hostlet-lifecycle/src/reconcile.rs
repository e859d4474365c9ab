//! Ledger reconciliation
//!
//! After an unclean restart, or a VM shut down outside hostlet, the ledger
//! can name holders that are no longer running. These are reported as
//! warnings and only released on request. A cluster's start-gate
//! reservation is expected while that start runs, possibly in another
//! process, and is only reported once it outlives the grace period.

use hostlet_core::{ClusterRecord, HostletError, Owner, PciAddress};
use hostlet_ledger::LedgerState;
use serde::Serialize;
use std::time::Duration;

/// A ledger entry that does not match live state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inconsistency {
    pub device: PciAddress,
    pub owner: Owner,
    /// What was actually observed
    pub observed: String,
}

impl Inconsistency {
    pub fn to_error(&self) -> HostletError {
        HostletError::LedgerInconsistency {
            device: self.device.clone(),
            owner: self.owner.clone(),
            observed: self.observed.clone(),
        }
    }
}

/// Compare every ledger entry against freshly derived cluster records
pub fn find_inconsistencies(
    records: &[ClusterRecord],
    ledger: &LedgerState,
    reservation_grace: Duration,
) -> Vec<Inconsistency> {
    ledger
        .allocations
        .iter()
        .filter_map(|(device, entry)| {
            let observed = match &entry.owner {
                Owner::Cluster(_) if !entry.is_older_than(reservation_grace) => return None,
                Owner::Cluster(name) => format!(
                    "cluster '{}' reservation is older than {}s (abandoned start)",
                    name,
                    reservation_grace.as_secs()
                ),
                Owner::Vm(name) => {
                    let vm = records.iter().find_map(|r| r.vm(name));
                    match vm {
                        None => format!("VM '{}' is not declared in any cluster", name),
                        Some(vm) if vm.device_address() != Some(device) => {
                            format!("VM '{}' does not declare this device", name)
                        }
                        Some(vm) if !vm.state.holds_device() => {
                            format!("VM '{}' is {}", name, vm.state)
                        }
                        Some(_) => return None,
                    }
                }
            };
            Some(Inconsistency {
                device: device.clone(),
                owner: entry.owner.clone(),
                observed,
            })
        })
        .collect()
}
