//! Owner, VM and cluster type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::device::{Device, PciAddress};

/// Identity that can hold a device in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Owner {
    /// A single virtual machine
    Vm(String),
    /// A whole cluster, held transitionally while its VMs are created
    Cluster(String),
}

impl Owner {
    pub fn vm(name: impl Into<String>) -> Self {
        Owner::Vm(name.into())
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Owner::Cluster(name.into())
    }

    /// The VM or cluster name
    pub fn name(&self) -> &str {
        match self {
            Owner::Vm(name) | Owner::Cluster(name) => name,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Vm(name) => write!(f, "vm:{}", name),
            Owner::Cluster(name) => write!(f, "cluster:{}", name),
        }
    }
}

/// Role of a cluster; also its position in the system start order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// Batch/training cluster, started first
    Training,
    /// Inference cluster, started second
    Inference,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Training => write!(f, "training"),
            ClusterRole::Inference => write!(f, "inference"),
        }
    }
}

/// State reported by the hypervisor for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Running,
    Paused,
    InShutdown,
    ShutOff,
    Crashed,
    Suspended,
    Unknown,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainState::Running => write!(f, "running"),
            DomainState::Paused => write!(f, "paused"),
            DomainState::InShutdown => write!(f, "in shutdown"),
            DomainState::ShutOff => write!(f, "shut off"),
            DomainState::Crashed => write!(f, "crashed"),
            DomainState::Suspended => write!(f, "pmsuspended"),
            DomainState::Unknown => write!(f, "unknown"),
        }
    }
}

/// VM lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Declared and possibly provisioned, never started
    Defined,
    /// Powered off
    Stopped,
    /// Start in progress
    Starting,
    /// Powered on
    Running,
    /// Stop in progress
    Stopping,
    /// Unrecoverable error during start or stop
    Failed,
}

impl VmState {
    /// Whether a VM in this state may hold a device
    pub fn holds_device(self) -> bool {
        matches!(self, VmState::Running | VmState::Starting)
    }
}

impl From<DomainState> for VmState {
    fn from(state: DomainState) -> Self {
        match state {
            // Paused and suspended domains keep their passthrough devices attached
            DomainState::Running | DomainState::Paused | DomainState::Suspended => {
                VmState::Running
            }
            DomainState::InShutdown => VmState::Stopping,
            DomainState::ShutOff => VmState::Stopped,
            DomainState::Crashed | DomainState::Unknown => VmState::Failed,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Defined => write!(f, "Defined"),
            VmState::Stopped => write!(f, "Stopped"),
            VmState::Starting => write!(f, "Starting"),
            VmState::Running => write!(f, "Running"),
            VmState::Stopping => write!(f, "Stopping"),
            VmState::Failed => write!(f, "Failed"),
        }
    }
}

/// Handle to a domain defined in the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    /// Domain name
    pub name: String,
    /// Domain UUID
    pub uuid: Uuid,
}

/// Input to the hypervisor's provision call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    /// Pre-rendered domain definition
    pub definition: Option<PathBuf>,
    /// Passthrough device attached to the domain
    pub device: Option<PciAddress>,
}

/// Sizing of a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub definition: Option<PathBuf>,
}

/// A VM within a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Unique VM name
    pub name: String,
    /// Owning cluster
    pub cluster: String,
    /// Assigned passthrough device
    pub device: Option<Device>,
    /// Whether cluster start powers this VM on
    pub auto_start: bool,
    /// Current lifecycle state
    pub state: VmState,
    /// Hypervisor handle, once provisioned
    pub handle: Option<VmHandle>,
    /// Sizing and domain definition
    pub resources: VmResources,
}

impl VmDescriptor {
    /// Ledger identity of this VM
    pub fn owner(&self) -> Owner {
        Owner::vm(self.name.clone())
    }

    /// Address of the assigned device, if any
    pub fn device_address(&self) -> Option<&PciAddress> {
        self.device.as_ref().map(|d| &d.pci_address)
    }

    pub fn is_provisioned(&self) -> bool {
        self.handle.is_some()
    }

    /// Build the hypervisor provisioning input
    pub fn spec(&self) -> VmSpec {
        VmSpec {
            name: self.name.clone(),
            cpu_cores: self.resources.cpu_cores,
            memory_gb: self.resources.memory_gb,
            disk_gb: self.resources.disk_gb,
            definition: self.resources.definition.clone(),
            device: self.device_address().cloned(),
        }
    }
}

/// Aggregate cluster status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Absent,
    Provisioning,
    PartiallyRunning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterStatus::Absent => write!(f, "Absent"),
            ClusterStatus::Provisioning => write!(f, "Provisioning"),
            ClusterStatus::PartiallyRunning => write!(f, "PartiallyRunning"),
            ClusterStatus::Running => write!(f, "Running"),
            ClusterStatus::Stopping => write!(f, "Stopping"),
            ClusterStatus::Stopped => write!(f, "Stopped"),
            ClusterStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// A cluster and its VMs, re-derived on every invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub name: String,
    pub role: ClusterRole,
    /// VMs in declaration order
    pub vms: Vec<VmDescriptor>,
}

impl ClusterRecord {
    /// Derive the cluster status from its VMs' states
    pub fn status(&self) -> ClusterStatus {
        let provisioned = self.vms.iter().filter(|vm| vm.is_provisioned()).count();
        if provisioned == 0 {
            return ClusterStatus::Absent;
        }

        let any = |state: VmState| self.vms.iter().any(|vm| vm.state == state);

        if any(VmState::Failed) {
            ClusterStatus::Failed
        } else if any(VmState::Stopping) {
            ClusterStatus::Stopping
        } else if any(VmState::Starting) || provisioned < self.vms.len() {
            ClusterStatus::Provisioning
        } else if !any(VmState::Running) {
            ClusterStatus::Stopped
        } else if self
            .vms
            .iter()
            .filter(|vm| vm.auto_start)
            .all(|vm| vm.state == VmState::Running)
        {
            ClusterStatus::Running
        } else {
            ClusterStatus::PartiallyRunning
        }
    }

    /// Find a VM by name
    pub fn vm(&self, name: &str) -> Option<&VmDescriptor> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    /// Find a VM by name, mutably
    pub fn vm_mut(&mut self, name: &str) -> Option<&mut VmDescriptor> {
        self.vms.iter_mut().find(|vm| vm.name == name)
    }

    /// Names of VMs that are powered on
    pub fn running_vms(&self) -> Vec<String> {
        self.vms
            .iter()
            .filter(|vm| vm.state == VmState::Running)
            .map(|vm| vm.name.clone())
            .collect()
    }
}
