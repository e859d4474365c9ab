//! In-memory hypervisor
//!
//! Keeps domains in a map instead of talking to libvirt. Faults can be
//! injected per VM, and every mutating call is journaled so tests can assert
//! ordering. Like real passthrough hardware, a domain cannot be started while
//! another running domain is attached to the same device.

use async_trait::async_trait;
use hostlet_core::{DomainState, HostletError, HostletResult, PciAddress, VmHandle, VmSpec};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::traits::Hypervisor;

/// A mutating call made against the simulated hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    Provision(String),
    Start(String),
    Stop { name: String, force: bool },
    Destroy(String),
}

#[derive(Debug)]
struct Domain {
    handle: VmHandle,
    state: DomainState,
    device: Option<PciAddress>,
}

#[derive(Debug, Default)]
struct Inner {
    domains: BTreeMap<String, Domain>,
    fail_provision: HashSet<String>,
    fail_start: HashSet<String>,
    ignore_shutdown: HashSet<String>,
    fail_stop: HashSet<String>,
    calls: Vec<HypervisorCall>,
}

/// In-memory hypervisor with fault injection
#[derive(Debug, Default)]
pub struct SimulatedHypervisor {
    inner: Mutex<Inner>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `provision` fail for a VM
    pub fn fail_provision(&self, name: &str) {
        self.inner().fail_provision.insert(name.to_string());
    }

    /// Make `start` fail for a VM
    pub fn fail_start(&self, name: &str) {
        self.inner().fail_start.insert(name.to_string());
    }

    /// Make graceful `stop` time out for a VM; forced stop still works
    pub fn ignore_shutdown(&self, name: &str) {
        self.inner().ignore_shutdown.insert(name.to_string());
    }

    /// Make every `stop` fail for a VM, forced or not
    pub fn fail_stop(&self, name: &str) {
        self.inner().fail_stop.insert(name.to_string());
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        let mut inner = self.inner();
        inner.fail_provision.clear();
        inner.fail_start.clear();
        inner.ignore_shutdown.clear();
        inner.fail_stop.clear();
    }

    /// Change a domain's state behind the coordinator's back
    pub fn set_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = self.inner().domains.get_mut(name) {
            domain.state = state;
        }
    }

    /// State of a domain, if defined
    pub fn domain_state(&self, name: &str) -> Option<DomainState> {
        self.inner().domains.get(name).map(|d| d.state)
    }

    /// Names of running domains
    pub fn running(&self) -> Vec<String> {
        self.inner()
            .domains
            .values()
            .filter(|d| d.state == DomainState::Running)
            .map(|d| d.handle.name.clone())
            .collect()
    }

    /// Journal of mutating calls, oldest first
    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.inner().calls.clone()
    }

    fn domain_mut<'a>(inner: &'a mut Inner, handle: &VmHandle) -> HostletResult<&'a mut Domain> {
        inner
            .domains
            .get_mut(&handle.name)
            .filter(|d| d.handle.uuid == handle.uuid)
            .ok_or_else(|| HostletError::Hypervisor(format!("Domain '{}' not found", handle.name)))
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    async fn provision(&self, spec: &VmSpec) -> HostletResult<VmHandle> {
        let mut inner = self.inner();
        inner.calls.push(HypervisorCall::Provision(spec.name.clone()));

        if inner.fail_provision.contains(&spec.name) {
            return Err(HostletError::Hypervisor(format!(
                "injected provision failure for '{}'",
                spec.name
            )));
        }

        let domain = inner.domains.entry(spec.name.clone()).or_insert_with(|| Domain {
            handle: VmHandle {
                name: spec.name.clone(),
                uuid: Uuid::new_v4(),
            },
            state: DomainState::ShutOff,
            device: None,
        });
        domain.device = spec.device.clone();

        debug!(vm = %spec.name, "Defined simulated domain");
        Ok(domain.handle.clone())
    }

    async fn start(&self, handle: &VmHandle) -> HostletResult<()> {
        let mut inner = self.inner();
        inner.calls.push(HypervisorCall::Start(handle.name.clone()));

        if inner.fail_start.contains(&handle.name) {
            return Err(HostletError::Hypervisor(format!(
                "injected start failure for '{}'",
                handle.name
            )));
        }

        let device = Self::domain_mut(&mut inner, handle)?.device.clone();
        if let Some(device) = device {
            let busy = inner.domains.values().find(|d| {
                d.handle.name != handle.name
                    && d.state == DomainState::Running
                    && d.device.as_ref() == Some(&device)
            });
            if let Some(other) = busy {
                return Err(HostletError::Hypervisor(format!(
                    "device {} is already attached to running domain '{}'",
                    device, other.handle.name
                )));
            }
        }

        Self::domain_mut(&mut inner, handle)?.state = DomainState::Running;
        Ok(())
    }

    async fn stop(&self, handle: &VmHandle, force: bool) -> HostletResult<bool> {
        let mut inner = self.inner();
        inner.calls.push(HypervisorCall::Stop {
            name: handle.name.clone(),
            force,
        });

        if inner.fail_stop.contains(&handle.name) {
            return Err(HostletError::Hypervisor(format!(
                "injected stop failure for '{}'",
                handle.name
            )));
        }
        let ignore = !force && inner.ignore_shutdown.contains(&handle.name);

        let domain = Self::domain_mut(&mut inner, handle)?;
        if domain.state == DomainState::ShutOff {
            return Ok(true);
        }
        if ignore {
            return Ok(false);
        }
        domain.state = DomainState::ShutOff;
        Ok(true)
    }

    async fn query_state(&self, handle: &VmHandle) -> HostletResult<DomainState> {
        let mut inner = self.inner();
        Ok(Self::domain_mut(&mut inner, handle)?.state)
    }

    async fn destroy(&self, handle: &VmHandle) -> HostletResult<()> {
        let mut inner = self.inner();
        inner.calls.push(HypervisorCall::Destroy(handle.name.clone()));

        if inner.fail_stop.contains(&handle.name) {
            return Err(HostletError::Hypervisor(format!(
                "injected stop failure for '{}'",
                handle.name
            )));
        }
        Self::domain_mut(&mut inner, handle)?;
        inner.domains.remove(&handle.name);
        Ok(())
    }

    async fn lookup(&self, name: &str) -> HostletResult<Option<VmHandle>> {
        Ok(self.inner().domains.get(name).map(|d| d.handle.clone()))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
