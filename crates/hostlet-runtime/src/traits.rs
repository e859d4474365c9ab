//! Hypervisor trait definitions

use async_trait::async_trait;
use hostlet_core::{DomainState, HostletResult, VmHandle, VmSpec};

/// Hypervisor trait for managing VM domains
///
/// Calls may block for seconds; callers must not hold the ledger lock
/// across them.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Define a domain for a VM and return its handle
    async fn provision(&self, spec: &VmSpec) -> HostletResult<VmHandle>;

    /// Power a domain on
    async fn start(&self, handle: &VmHandle) -> HostletResult<()>;

    /// Power a domain off
    ///
    /// Returns whether the domain is off when the call returns. A graceful
    /// stop that times out returns `false`.
    async fn stop(&self, handle: &VmHandle, force: bool) -> HostletResult<bool>;

    /// Current domain state
    async fn query_state(&self, handle: &VmHandle) -> HostletResult<DomainState>;

    /// Remove a domain definition, powering it off first if needed
    async fn destroy(&self, handle: &VmHandle) -> HostletResult<()>;

    /// Find an existing domain by name
    async fn lookup(&self, name: &str) -> HostletResult<Option<VmHandle>>;

    /// Get the hypervisor name
    fn name(&self) -> &'static str;
}
