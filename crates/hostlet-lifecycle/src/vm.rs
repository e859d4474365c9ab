//! VM lifecycle coordination
//!
//! Drives one VM through `Defined -> Stopped -> Starting -> Running ->
//! Stopping -> Stopped`. A VM with a device is granted it in the ledger
//! before the hypervisor starts it, and gives it back after the hypervisor
//! stops it. The ledger lock is never held across a hypervisor call.

use hostlet_core::{DomainState, HostletError, HostletResult, VmDescriptor, VmState};
use hostlet_ledger::ResourceAllocator;
use hostlet_runtime::Hypervisor;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coordinates hypervisor calls and device allocation for single VMs
#[derive(Clone)]
pub struct VmCoordinator {
    hypervisor: Arc<dyn Hypervisor>,
    allocator: ResourceAllocator,
}

impl VmCoordinator {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, allocator: ResourceAllocator) -> Self {
        Self {
            hypervisor,
            allocator,
        }
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Re-derive a VM's handle and state from the hypervisor
    pub async fn refresh(&self, vm: &mut VmDescriptor) -> HostletResult<()> {
        vm.handle = self.hypervisor.lookup(&vm.name).await?;
        vm.state = match &vm.handle {
            Some(handle) => self.hypervisor.query_state(handle).await?.into(),
            None => VmState::Defined,
        };
        Ok(())
    }

    /// Define the VM in the hypervisor
    pub async fn provision(&self, vm: &mut VmDescriptor) -> HostletResult<()> {
        if vm.is_provisioned() {
            return Ok(());
        }

        let handle = self
            .hypervisor
            .provision(&vm.spec())
            .await
            .map_err(|e| HostletError::ProvisioningFailure {
                vm: vm.name.clone(),
                reason: e.to_string(),
            })?;

        info!(vm = %vm.name, uuid = %handle.uuid, "Provisioned VM");
        vm.handle = Some(handle);
        vm.state = VmState::Defined;
        Ok(())
    }

    /// Remove the VM's definition from the hypervisor
    pub async fn deprovision(&self, vm: &mut VmDescriptor) -> HostletResult<()> {
        if let Some(handle) = vm.handle.clone() {
            self.hypervisor.destroy(&handle).await?;
        }
        self.release_device(vm)?;

        info!(vm = %vm.name, "Deprovisioned VM");
        vm.handle = None;
        vm.state = VmState::Defined;
        Ok(())
    }

    /// Allocate the VM's device, then power it on
    ///
    /// A conflict leaves the VM untouched. A hypervisor failure releases the
    /// device again and leaves the VM `Failed`.
    pub async fn start(&self, vm: &mut VmDescriptor) -> HostletResult<()> {
        let handle = vm
            .handle
            .clone()
            .ok_or_else(|| HostletError::VmNotProvisioned(vm.name.clone()))?;
        let owner = vm.owner();
        let device = vm.device_address().cloned();

        let current = VmState::from(self.hypervisor.query_state(&handle).await?);

        if let Some(device) = &device {
            self.allocator.try_allocate(device, &owner)?;
        }

        if current == VmState::Running {
            debug!(vm = %vm.name, "VM already running");
            vm.state = VmState::Running;
            return Ok(());
        }

        info!(vm = %vm.name, device = ?device.as_ref().map(|d| d.as_str()), "Starting VM");
        vm.state = VmState::Starting;

        if let Err(e) = self.hypervisor.start(&handle).await {
            if let Some(device) = &device {
                if let Err(release_err) = self.allocator.release_held_by(device, &owner) {
                    warn!(
                        vm = %vm.name,
                        device = %device,
                        error = %release_err,
                        "Failed to release device after start failure"
                    );
                }
            }
            vm.state = VmState::Failed;
            return Err(HostletError::ProvisioningFailure {
                vm: vm.name.clone(),
                reason: e.to_string(),
            });
        }

        vm.state = VmState::Running;
        info!(vm = %vm.name, "VM running");
        Ok(())
    }

    /// Power the VM off and release its device
    ///
    /// Returns whether the VM is stopped. The device is released on every
    /// path, including a domain that no longer exists and a hypervisor error,
    /// but only if this VM holds it.
    pub async fn stop(&self, vm: &mut VmDescriptor, force: bool) -> HostletResult<bool> {
        let result = self.power_off(vm, force).await;

        if let Err(release_err) = self.release_device(vm) {
            if result.is_ok() {
                return Err(release_err);
            }
            warn!(vm = %vm.name, error = %release_err, "Failed to release device after stop failure");
        }

        match result {
            Ok(true) => {
                if vm.is_provisioned() {
                    vm.state = VmState::Stopped;
                }
                Ok(true)
            }
            Ok(false) => {
                warn!(vm = %vm.name, "VM did not stop");
                vm.state = VmState::Failed;
                Ok(false)
            }
            Err(e) => {
                vm.state = VmState::Failed;
                Err(e)
            }
        }
    }

    async fn power_off(&self, vm: &mut VmDescriptor, force: bool) -> HostletResult<bool> {
        let Some(handle) = vm.handle.clone() else {
            debug!(vm = %vm.name, "VM has no domain");
            return Ok(true);
        };

        if self.hypervisor.query_state(&handle).await? == DomainState::ShutOff {
            debug!(vm = %vm.name, "VM not running");
            return Ok(true);
        }

        info!(vm = %vm.name, force = force, "Stopping VM");
        vm.state = VmState::Stopping;
        self.hypervisor.stop(&handle, force).await
    }

    fn release_device(&self, vm: &VmDescriptor) -> HostletResult<()> {
        if let Some(device) = vm.device_address() {
            self.allocator.release_held_by(device, &vm.owner())?;
        }
        Ok(())
    }

    /// Stop then start
    ///
    /// If the start fails the VM is left `Stopped` with its device released.
    pub async fn restart(&self, vm: &mut VmDescriptor) -> HostletResult<()> {
        if !self.stop(vm, false).await? {
            return Err(HostletError::PartialStopFailure {
                cluster: vm.cluster.clone(),
                vms: vec![vm.name.clone()],
            });
        }

        if let Err(e) = self.start(vm).await {
            vm.state = VmState::Stopped;
            return Err(e);
        }
        Ok(())
    }
}
