//! Cluster lifecycle management
//!
//! A cluster start first reserves every device its auto-start VMs need in
//! one ledger transaction, under the cluster's own identity. Each reservation
//! is handed to its VM right before that VM starts, and anything left over is
//! released when the start returns, successful or not.

use hostlet_core::{
    ClusterConfig, ClusterRecord, ClusterRole, ClusterStatus, HostletError, HostletResult, Owner,
    PciAddress, VmDescriptor, VmState,
};
use tracing::{error, info, warn};

use crate::rollback::{Compensation, Compensations};
use crate::vm::VmCoordinator;

/// Orchestrates every VM of one cluster
#[derive(Clone)]
pub struct ClusterManager {
    config: ClusterConfig,
    vms: VmCoordinator,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig, vms: VmCoordinator) -> Self {
        Self { config, vms }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn role(&self) -> ClusterRole {
        self.config.role
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Identity used for transitional reservations
    pub fn owner(&self) -> Owner {
        Owner::cluster(self.config.name.clone())
    }

    /// Whether this cluster declares a VM
    pub fn declares(&self, vm: &str) -> bool {
        self.config.vms.iter().any(|v| v.name == vm)
    }

    pub fn validate(&self) -> HostletResult<()> {
        self.config.validate()
    }

    /// Re-derive the cluster record from configuration and live VM state
    ///
    /// A VM that is running without holding its device in the ledger is
    /// reported `Failed`: its stop was attempted and did not take effect.
    pub async fn record(&self) -> HostletResult<ClusterRecord> {
        let mut record = self.config.record();
        for vm in record.vms.iter_mut() {
            self.vms.refresh(vm).await?;
        }

        let ledger = self.vms.allocator().snapshot()?;
        for vm in record.vms.iter_mut().filter(|vm| vm.state == VmState::Running) {
            let Some(device) = vm.device_address() else {
                continue;
            };
            let holder = ledger.get(device).map(|entry| entry.owner.clone());
            if holder.as_ref() != Some(&vm.owner()) {
                warn!(vm = %vm.name, device = %device, holder = ?holder, "VM running without its device allocation");
                vm.state = VmState::Failed;
            }
        }

        Ok(record)
    }

    pub async fn status(&self) -> HostletResult<ClusterStatus> {
        Ok(self.record().await?.status())
    }

    /// Devices the start gate must reserve
    ///
    /// A device already held by the VM that declares it needs no reservation.
    fn gate_devices(&self, record: &ClusterRecord) -> HostletResult<Vec<PciAddress>> {
        let allocator = self.vms.allocator();
        let mut devices = Vec::new();

        for vm in record.vms.iter().filter(|vm| vm.auto_start) {
            let Some(device) = vm.device_address() else {
                continue;
            };
            let held_by_vm = allocator
                .owner_of(device)?
                .is_some_and(|entry| entry.owner == vm.owner());
            if !held_by_vm {
                devices.push(device.clone());
            }
        }

        Ok(devices)
    }

    /// Validate, reserve, provision every VM and start the auto-start ones
    ///
    /// On failure every VM created or started by this call is stopped and
    /// deprovisioned again before the first error is returned.
    pub async fn start(&self) -> HostletResult<ClusterRecord> {
        self.validate()?;

        let mut record = self.record().await?;
        let owner = self.owner();
        let gate = self.gate_devices(&record)?;

        info!(cluster = %self.name(), devices = gate.len(), "Starting cluster");
        self.vms.allocator().reserve_all(&gate, &owner)?;

        let mut compensations = Compensations::new();
        let result = self
            .provision_and_start(&mut record, &owner, &mut compensations)
            .await;

        if let Err(e) = &result {
            error!(
                cluster = %self.name(),
                error = %e,
                steps = compensations.len(),
                "Cluster start failed, rolling back"
            );
            self.compensate(&mut record, compensations).await;
        }

        self.release_reservations(&owner);

        result.map(|()| {
            info!(cluster = %self.name(), status = %record.status(), "Cluster started");
            record
        })
    }

    async fn provision_and_start(
        &self,
        record: &mut ClusterRecord,
        owner: &Owner,
        compensations: &mut Compensations,
    ) -> HostletResult<()> {
        for vm in record.vms.iter_mut() {
            if !vm.is_provisioned() {
                self.vms.provision(vm).await?;
                compensations.push(Compensation::Deprovision(vm.name.clone()));
            }
        }

        for vm in record.vms.iter_mut().filter(|vm| vm.auto_start) {
            if vm.state == VmState::Running {
                continue;
            }
            if let Some(device) = vm.device_address() {
                self.vms
                    .allocator()
                    .transfer(device, owner, &vm.owner())?;
            }
            self.vms.start(vm).await?;
            compensations.push(Compensation::StopVm(vm.name.clone()));
        }

        Ok(())
    }

    async fn compensate(&self, record: &mut ClusterRecord, compensations: Compensations) {
        for action in compensations.unwind() {
            let (name, result) = match &action {
                Compensation::StopVm(name) => match record.vm_mut(name) {
                    Some(vm) => (name, self.vms.stop(vm, true).await.map(|_| ())),
                    None => continue,
                },
                Compensation::Deprovision(name) => match record.vm_mut(name) {
                    Some(vm) => (name, self.vms.deprovision(vm).await),
                    None => continue,
                },
            };
            if let Err(e) = result {
                warn!(vm = %name, action = ?action, error = %e, "Compensating action failed");
            }
        }
    }

    fn release_reservations(&self, owner: &Owner) {
        match self.vms.allocator().release_all_held_by(owner) {
            Ok(released) if !released.is_empty() => {
                info!(cluster = %self.name(), devices = ?released, "Released leftover reservations")
            }
            Ok(_) => {}
            Err(e) => warn!(cluster = %self.name(), error = %e, "Failed to release reservations"),
        }
    }

    /// Stop VMs in reverse declaration order, collecting the ones that stay up
    ///
    /// Unprovisioned VMs are included so a device held by a vanished domain
    /// is still released. Gate reservations are left alone: they may belong
    /// to a start running in another process.
    async fn stop_vms(&self, record: &mut ClusterRecord, force_fallback: bool) -> Vec<String> {
        let mut stuck = Vec::new();

        for vm in record.vms.iter_mut().rev() {
            let mut stopped = self.stop_one(vm, false).await;
            if !stopped && force_fallback {
                warn!(vm = %vm.name, "Graceful stop failed, forcing");
                stopped = self.stop_one(vm, true).await;
            }
            if !stopped {
                stuck.push(vm.name.clone());
            }
        }

        stuck
    }

    async fn stop_one(&self, vm: &mut VmDescriptor, force: bool) -> bool {
        match self.vms.stop(vm, force).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!(vm = %vm.name, error = %e, "Failed to stop VM");
                false
            }
        }
    }

    fn stop_outcome(&self, record: ClusterRecord, stuck: Vec<String>) -> HostletResult<ClusterRecord> {
        if stuck.is_empty() {
            info!(cluster = %self.name(), "Cluster stopped");
            Ok(record)
        } else {
            Err(HostletError::PartialStopFailure {
                cluster: self.config.name.clone(),
                vms: stuck,
            })
        }
    }

    /// Stop every VM, best effort
    pub async fn stop(&self) -> HostletResult<ClusterRecord> {
        info!(cluster = %self.name(), "Stopping cluster");
        let mut record = self.record().await?;
        let stuck = self.stop_vms(&mut record, false).await;
        self.stop_outcome(record, stuck)
    }

    /// Stop every VM, forcing the ones that do not stop gracefully
    pub async fn stop_forced(&self) -> HostletResult<ClusterRecord> {
        info!(cluster = %self.name(), "Force stopping cluster");
        let mut record = self.record().await?;
        let stuck = self.stop_vms(&mut record, true).await;
        self.stop_outcome(record, stuck)
    }

    /// Stop every VM and remove all VM definitions
    pub async fn destroy(&self) -> HostletResult<()> {
        info!(cluster = %self.name(), "Destroying cluster");
        let mut record = self.record().await?;

        let stuck = self.stop_vms(&mut record, true).await;
        if !stuck.is_empty() {
            return Err(HostletError::PartialStopFailure {
                cluster: self.config.name.clone(),
                vms: stuck,
            });
        }

        let mut first_error = None;
        for vm in record.vms.iter_mut().rev() {
            if let Err(e) = self.vms.deprovision(vm).await {
                warn!(vm = %vm.name, error = %e, "Failed to deprovision VM");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(cluster = %self.name(), "Cluster destroyed");
                Ok(())
            }
        }
    }

    /// Start a single VM of this cluster
    pub async fn start_vm(&self, name: &str) -> HostletResult<VmDescriptor> {
        let mut record = self.record().await?;
        let vm = self.find(&mut record, name)?;
        self.vms.start(vm).await?;
        Ok(vm.clone())
    }

    /// Stop a single VM of this cluster
    pub async fn stop_vm(&self, name: &str, force: bool) -> HostletResult<VmDescriptor> {
        let mut record = self.record().await?;
        let vm = self.find(&mut record, name)?;
        if !self.vms.stop(vm, force).await? {
            return Err(HostletError::PartialStopFailure {
                cluster: self.config.name.clone(),
                vms: vec![name.to_string()],
            });
        }
        Ok(vm.clone())
    }

    /// Restart a single VM of this cluster
    pub async fn restart_vm(&self, name: &str) -> HostletResult<VmDescriptor> {
        let mut record = self.record().await?;
        let vm = self.find(&mut record, name)?;
        self.vms.restart(vm).await?;
        Ok(vm.clone())
    }

    fn find<'a>(&self, record: &'a mut ClusterRecord, name: &str) -> HostletResult<&'a mut VmDescriptor> {
        record
            .vm_mut(name)
            .ok_or_else(|| HostletError::VmNotFound(format!("{} (cluster '{}')", name, self.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use hostlet_runtime::{Hypervisor, HypervisorCall};

    #[tokio::test]
    async fn test_start_skips_manual_vms() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        let cloud = fx.cluster("cloud");

        let record = hpc.start().await.unwrap();
        assert_eq!(record.status(), ClusterStatus::Running);
        assert_eq!(fx.holder("0000:01:00.0"), Some(Owner::vm("hpc-compute-01")));
        assert_eq!(fx.holder("0000:02:00.0"), Some(Owner::vm("hpc-compute-02")));

        let record = cloud.start().await.unwrap();
        assert_eq!(record.status(), ClusterStatus::Running);
        let worker = record.vm("cloud-gpu-worker-01").unwrap();
        assert!(worker.is_provisioned());
        assert!(!worker.state.holds_device());
        assert_eq!(fx.holder("0000:01:00.0"), Some(Owner::vm("hpc-compute-01")));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");

        hpc.start().await.unwrap();
        let record = hpc.start().await.unwrap();
        assert_eq!(record.status(), ClusterStatus::Running);
        assert!(fx.allocator.snapshot().unwrap().held_by(&hpc.owner()).is_empty());
    }

    #[tokio::test]
    async fn test_gate_aborts_before_creating_vms() {
        let fx = Fixture::new();
        fx.allocator
            .try_allocate(&"0000:02:00.0".parse().unwrap(), &Owner::vm("elsewhere"))
            .unwrap();

        let hpc = fx.cluster("hpc");
        let result = hpc.start().await;
        assert!(matches!(result, Err(HostletError::ResourceConflict { .. })));
        assert!(fx.hypervisor.calls().is_empty());
        assert_eq!(fx.holder("0000:01:00.0"), None);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let fx = Fixture::new();
        fx.hypervisor.fail_start("hpc-compute-02");
        let hpc = fx.cluster("hpc");

        let result = hpc.start().await;
        assert!(matches!(result, Err(HostletError::ProvisioningFailure { .. })));

        assert!(fx.hypervisor.running().is_empty());
        assert!(fx.allocator.snapshot().unwrap().is_empty());
        assert_eq!(hpc.status().await.unwrap(), ClusterStatus::Absent);

        // Rollback runs newest first: the started VMs stop before anything is undefined
        let calls = fx.hypervisor.calls();
        let first_destroy = calls
            .iter()
            .position(|c| matches!(c, HypervisorCall::Destroy(_)))
            .unwrap();
        let last_stop = calls
            .iter()
            .rposition(|c| matches!(c, HypervisorCall::Stop { .. }))
            .unwrap();
        assert!(last_stop < first_destroy);
    }

    #[tokio::test]
    async fn test_stop_reports_stuck_vms() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        hpc.start().await.unwrap();

        fx.hypervisor.ignore_shutdown("hpc-compute-01");
        match hpc.stop().await {
            Err(HostletError::PartialStopFailure { cluster, vms }) => {
                assert_eq!(cluster, "hpc");
                assert_eq!(vms, vec!["hpc-compute-01"]);
            }
            other => panic!("expected partial stop failure, got {:?}", other),
        }
        assert_eq!(hpc.status().await.unwrap(), ClusterStatus::Failed);

        fx.hypervisor.clear_faults();
        let record = hpc.stop().await.unwrap();
        assert_eq!(record.status(), ClusterStatus::Stopped);
        assert!(fx.allocator.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_order_is_reverse_declaration() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        hpc.start().await.unwrap();
        hpc.stop().await.unwrap();

        let stops: Vec<String> = fx
            .hypervisor
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                HypervisorCall::Stop { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec!["hpc-compute-02", "hpc-compute-01", "hpc-controller"]);
    }

    #[tokio::test]
    async fn test_destroy_forces_and_undefines() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        hpc.start().await.unwrap();

        fx.hypervisor.ignore_shutdown("hpc-controller");
        hpc.destroy().await.unwrap();

        assert_eq!(hpc.status().await.unwrap(), ClusterStatus::Absent);
        assert!(fx.allocator.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_vm_operations() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        hpc.start().await.unwrap();

        let vm = hpc.stop_vm("hpc-compute-01", false).await.unwrap();
        assert_eq!(vm.state, VmState::Stopped);
        assert_eq!(fx.holder("0000:01:00.0"), None);
        assert_eq!(hpc.status().await.unwrap(), ClusterStatus::PartiallyRunning);

        let vm = hpc.start_vm("hpc-compute-01").await.unwrap();
        assert_eq!(vm.state, VmState::Running);

        let vm = hpc.restart_vm("hpc-compute-01").await.unwrap();
        assert_eq!(vm.state, VmState::Running);
        assert_eq!(fx.holder("0000:01:00.0"), Some(Owner::vm("hpc-compute-01")));

        assert!(matches!(
            hpc.start_vm("cloud-controller").await,
            Err(HostletError::VmNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_releases_devices_of_vanished_domains() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        let record = hpc.start().await.unwrap();

        let handle = record.vm("hpc-compute-02").unwrap().handle.clone().unwrap();
        fx.hypervisor.destroy(&handle).await.unwrap();

        hpc.stop().await.unwrap();
        assert!(fx.allocator.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_keeps_gate_reservations() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        hpc.start().await.unwrap();
        hpc.stop_vm("hpc-compute-02", false).await.unwrap();

        // Another process is between its gate and the transfer to the VM
        fx.allocator
            .try_allocate(&"0000:02:00.0".parse().unwrap(), &hpc.owner())
            .unwrap();

        hpc.stop().await.unwrap();
        assert_eq!(fx.holder("0000:02:00.0"), Some(hpc.owner()));
        assert_eq!(fx.holder("0000:01:00.0"), None);
    }

    #[tokio::test]
    async fn test_running_vm_without_allocation_is_failed() {
        let fx = Fixture::new();
        let hpc = fx.cluster("hpc");
        hpc.start().await.unwrap();

        fx.allocator.release(&"0000:01:00.0".parse().unwrap()).unwrap();

        let record = hpc.record().await.unwrap();
        assert_eq!(record.vm("hpc-compute-01").unwrap().state, VmState::Failed);
        assert_eq!(record.status(), ClusterStatus::Failed);

        // Starting again re-adopts the running VM and its device
        let record = hpc.start().await.unwrap();
        assert_eq!(record.status(), ClusterStatus::Running);
        assert_eq!(fx.holder("0000:01:00.0"), Some(Owner::vm("hpc-compute-01")));
    }
}
