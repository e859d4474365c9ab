//! Error types for hostlet

use thiserror::Error;

use crate::device::PciAddress;
use crate::model::Owner;

/// Main error type for hostlet
#[derive(Error, Debug)]
pub enum HostletError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The same device is declared more than once inside one cluster
    #[error(
        "Configuration conflict: device {device} is declared by more than one VM in cluster '{cluster}' ({})",
        .vms.join(", ")
    )]
    ConfigurationConflict {
        cluster: String,
        device: PciAddress,
        vms: Vec<String>,
    },

    /// Device is held by a different owner
    #[error(
        "Resource conflict: device {device} is currently allocated to {owner} (requested by {requester}); stop {owner} first"
    )]
    ResourceConflict {
        device: PciAddress,
        owner: Owner,
        requester: Owner,
    },

    /// A hypervisor call failed while provisioning or starting a VM
    #[error("Provisioning failure for VM '{vm}': {reason}")]
    ProvisioningFailure { vm: String, reason: String },

    /// One or more VMs did not stop
    #[error("Partial stop failure in cluster '{cluster}': VMs not stopped: {}", .vms.join(", "))]
    PartialStopFailure { cluster: String, vms: Vec<String> },

    /// Ledger entry whose holder is not actually running
    #[error(
        "Ledger inconsistency: device {device} is recorded for {owner} but {observed}; release it with `hostlet gpu release {device}`"
    )]
    LedgerInconsistency {
        device: PciAddress,
        owner: Owner,
        observed: String,
    },

    /// Ledger storage error
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Hypervisor error
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    /// VM not found
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// Cluster not found
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// VM has no hypervisor definition yet
    #[error("VM '{0}' has not been provisioned")]
    VmNotProvisioned(String),

    /// Destructive operation attempted without confirmation
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// A later cluster failed during a system start
    #[error(
        "System start failed at cluster '{cluster}' (rolled back: {}): {source}",
        rolled_back_list(.rolled_back)
    )]
    SystemStartFailed {
        cluster: String,
        source: Box<HostletError>,
        rolled_back: Vec<String>,
    },

    /// A best-effort system operation collected one or more failures
    #[error("System {operation} failed: {}", error_list(.failures))]
    SystemOperationFailed {
        operation: String,
        failures: Vec<HostletError>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for hostlet operations
pub type HostletResult<T> = Result<T, HostletError>;

fn rolled_back_list(clusters: &[String]) -> String {
    if clusters.is_empty() {
        "none".to_string()
    } else {
        clusters.join(", ")
    }
}

fn error_list(errors: &[HostletError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for HostletError {
    fn from(err: serde_json::Error) -> Self {
        HostletError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for HostletError {
    fn from(err: toml::de::Error) -> Self {
        HostletError::Config(err.to_string())
    }
}
