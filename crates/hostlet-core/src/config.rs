//! Configuration types for hostlet

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conflict::find_duplicate_devices;
use crate::device::Device;
use crate::error::{HostletError, HostletResult};
use crate::model::{ClusterRecord, ClusterRole, VmDescriptor, VmResources, VmState};

/// Main host configuration (`hostlet.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Hypervisor configuration
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Declared clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl HostConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> HostletResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HostletError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> HostletResult<Self> {
        toml::from_str(content)
            .map_err(|e| HostletError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate the configuration as a whole
    pub fn validate(&self) -> HostletResult<()> {
        let mut roles = HashSet::new();
        let mut cluster_names = HashSet::new();
        let mut vm_names = HashSet::new();

        for cluster in &self.clusters {
            if !roles.insert(cluster.role) {
                return Err(HostletError::Config(format!(
                    "More than one {} cluster declared",
                    cluster.role
                )));
            }
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(HostletError::Config(format!(
                    "Duplicate cluster name '{}'",
                    cluster.name
                )));
            }
            cluster.validate()?;
            for vm in &cluster.vms {
                if !vm_names.insert(vm.name.as_str()) {
                    return Err(HostletError::Config(format!(
                        "VM name '{}' is used by more than one cluster",
                        vm.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Find a cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Find the cluster configured for a role
    pub fn cluster_for_role(&self, role: ClusterRole) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.role == role)
    }
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path of the ledger file shared by every process on the host
    pub path: PathBuf,
    /// Age after which a cluster's start-gate reservation counts as abandoned
    #[serde(default = "default_reservation_grace_secs")]
    pub reservation_grace_secs: u64,
}

impl LedgerConfig {
    pub fn reservation_grace(&self) -> Duration {
        Duration::from_secs(self.reservation_grace_secs)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/hostlet/ledger.json"),
            reservation_grace_secs: default_reservation_grace_secs(),
        }
    }
}

/// Hypervisor backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    /// libvirt through the virsh command line
    #[default]
    Virsh,
    /// In-memory hypervisor, for dry runs and tests
    Simulated,
}

/// Hypervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub kind: HypervisorKind,
    /// libvirt connection URI
    pub uri: String,
    /// Path to the virsh binary
    pub virsh_path: PathBuf,
    /// How long a graceful shutdown may take before it is reported as failed
    pub shutdown_timeout_secs: u64,
    /// Interval between domain state polls
    pub poll_interval_ms: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            kind: HypervisorKind::Virsh,
            uri: "qemu:///system".to_string(),
            virsh_path: PathBuf::from("virsh"),
            shutdown_timeout_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// One cluster's declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub role: ClusterRole,
    #[serde(default)]
    pub vms: Vec<VmConfig>,
}

impl ClusterConfig {
    /// Validate this cluster in isolation
    pub fn validate(&self) -> HostletResult<()> {
        if self.name.trim().is_empty() {
            return Err(HostletError::Config("Cluster name is empty".to_string()));
        }
        if self.vms.is_empty() {
            return Err(HostletError::Config(format!(
                "Cluster '{}' declares no VMs",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for vm in &self.vms {
            if vm.name.trim().is_empty() {
                return Err(HostletError::Config(format!(
                    "Cluster '{}' has a VM with an empty name",
                    self.name
                )));
            }
            if !names.insert(vm.name.as_str()) {
                return Err(HostletError::Config(format!(
                    "Duplicate VM name '{}' in cluster '{}'",
                    vm.name, self.name
                )));
            }
        }

        if let Some(dup) = find_duplicate_devices(self).into_iter().next() {
            return Err(HostletError::ConfigurationConflict {
                cluster: dup.cluster,
                device: dup.device,
                vms: dup.vms,
            });
        }

        Ok(())
    }

    /// Build an unprovisioned record for this cluster
    pub fn record(&self) -> ClusterRecord {
        ClusterRecord {
            name: self.name.clone(),
            role: self.role,
            vms: self.vms.iter().map(|vm| vm.descriptor(&self.name)).collect(),
        }
    }
}

/// One VM's declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Pre-rendered libvirt domain XML
    #[serde(default)]
    pub domain_xml: Option<PathBuf>,
    /// Passthrough device
    #[serde(default)]
    pub device: Option<Device>,
}

impl VmConfig {
    /// Build an unprovisioned descriptor for this VM
    pub fn descriptor(&self, cluster: &str) -> VmDescriptor {
        VmDescriptor {
            name: self.name.clone(),
            cluster: cluster.to_string(),
            device: self.device.clone(),
            auto_start: self.auto_start,
            state: VmState::Defined,
            handle: None,
            resources: VmResources {
                cpu_cores: self.cpu_cores,
                memory_gb: self.memory_gb,
                disk_gb: self.disk_gb,
                definition: self.domain_xml.clone(),
            },
        }
    }
}

fn default_reservation_grace_secs() -> u64 {
    600
}

fn default_cpu_cores() -> u32 {
    2
}

fn default_memory_gb() -> u32 {
    4
}

fn default_disk_gb() -> u32 {
    20
}

fn default_auto_start() -> bool {
    true
}
