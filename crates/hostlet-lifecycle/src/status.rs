//! System status and topology reporting

use hostlet_core::{
    ClusterRecord, ClusterRole, ClusterStatus, DeviceSummary, Owner, PciAddress, VmState,
};
use hostlet_ledger::LedgerState;
use serde::Serialize;
use std::fmt;

use crate::reconcile::Inconsistency;

/// Overall health across clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    /// Every configured cluster is running
    Running,
    /// No cluster is running
    Stopped,
    /// Some clusters running, some not
    Mixed,
    /// At least one cluster has failed VMs
    Error,
}

impl SystemHealth {
    /// Derive overall health from cluster statuses
    pub fn from_statuses(statuses: &[ClusterStatus]) -> Self {
        let idle = |s: &ClusterStatus| matches!(s, ClusterStatus::Absent | ClusterStatus::Stopped);

        if statuses.contains(&ClusterStatus::Failed) {
            SystemHealth::Error
        } else if statuses.iter().all(idle) {
            SystemHealth::Stopped
        } else if statuses.iter().all(|s| *s == ClusterStatus::Running) {
            SystemHealth::Running
        } else {
            SystemHealth::Mixed
        }
    }
}

impl fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemHealth::Running => write!(f, "running"),
            SystemHealth::Stopped => write!(f, "stopped"),
            SystemHealth::Mixed => write!(f, "mixed"),
            SystemHealth::Error => write!(f, "error"),
        }
    }
}

/// One VM's line in a status report
#[derive(Debug, Clone, Serialize)]
pub struct VmSummary {
    pub name: String,
    pub state: VmState,
    pub auto_start: bool,
    pub device: Option<PciAddress>,
    /// Ledger holder of the VM's device, if any
    pub device_holder: Option<Owner>,
}

/// One cluster's section of a status report
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub name: String,
    pub role: ClusterRole,
    pub status: ClusterStatus,
    pub vms: Vec<VmSummary>,
}

impl ClusterSummary {
    pub fn new(record: &ClusterRecord, ledger: &LedgerState) -> Self {
        let vms = record
            .vms
            .iter()
            .map(|vm| {
                let device = vm.device_address().cloned();
                let device_holder = device
                    .as_ref()
                    .and_then(|d| ledger.get(d))
                    .map(|entry| entry.owner.clone());
                VmSummary {
                    name: vm.name.clone(),
                    state: vm.state,
                    auto_start: vm.auto_start,
                    device,
                    device_holder,
                }
            })
            .collect();

        Self {
            name: record.name.clone(),
            role: record.role,
            status: record.status(),
            vms,
        }
    }
}

/// Read-only snapshot of the whole system
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub health: SystemHealth,
    /// Clusters in start order
    pub clusters: Vec<ClusterSummary>,
    pub ledger: LedgerState,
    pub topology: DeviceSummary,
    pub warnings: Vec<Inconsistency>,
}
