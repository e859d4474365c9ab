//! System coordination across clusters
//!
//! Clusters start in role order (training, then inference) and stop in the
//! exact reverse. A failed start of a later cluster stops every cluster
//! started before it.

use hostlet_core::{
    detect_shared_devices, device_summary, DeviceUsage, HostConfig, HostletError, HostletResult,
    Owner, VmDescriptor,
};
use hostlet_ledger::ResourceAllocator;
use tracing::{error, info, warn};

use crate::cluster::ClusterManager;
use crate::reconcile::{find_inconsistencies, Inconsistency};
use crate::status::{ClusterSummary, SystemHealth, SystemStatus};
use crate::vm::VmCoordinator;

/// Sequences cluster managers and aggregates their state
pub struct SystemCoordinator {
    config: HostConfig,
    /// Cluster managers in start order
    clusters: Vec<ClusterManager>,
    vms: VmCoordinator,
}

impl SystemCoordinator {
    /// Build a coordinator for a validated configuration
    pub fn new(config: HostConfig, vms: VmCoordinator) -> HostletResult<Self> {
        config.validate()?;

        let mut clusters: Vec<ClusterManager> = config
            .clusters
            .iter()
            .map(|c| ClusterManager::new(c.clone(), vms.clone()))
            .collect();
        clusters.sort_by_key(|c| c.role());

        Ok(Self {
            config,
            clusters,
            vms,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Allocator over the shared device ledger
    pub fn allocator(&self) -> &ResourceAllocator {
        self.vms.allocator()
    }

    /// Cluster managers in start order
    pub fn clusters(&self) -> &[ClusterManager] {
        &self.clusters
    }

    /// Find a cluster manager by name
    pub fn cluster(&self, name: &str) -> HostletResult<&ClusterManager> {
        self.clusters
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| HostletError::ClusterNotFound(name.to_string()))
    }

    /// Find the cluster that declares a VM
    pub fn find_vm(&self, name: &str) -> HostletResult<&ClusterManager> {
        self.clusters
            .iter()
            .find(|c| c.declares(name))
            .ok_or_else(|| HostletError::VmNotFound(name.to_string()))
    }

    /// Devices declared by more than one cluster
    pub fn shared_devices(&self) -> DeviceUsage {
        detect_shared_devices(&self.config.clusters)
    }

    /// Start every cluster in order
    pub async fn start_all(&self) -> HostletResult<()> {
        let shared = self.shared_devices();
        if !shared.is_empty() {
            info!(devices = shared.len(), "Clusters share devices; auto-start VMs of later clusters may conflict");
        }

        let mut started: Vec<&ClusterManager> = Vec::new();

        for cluster in &self.clusters {
            info!(cluster = %cluster.name(), role = %cluster.role(), "Starting cluster");

            if let Err(e) = cluster.start().await {
                error!(cluster = %cluster.name(), error = %e, "Cluster start failed, rolling back system");

                let mut rolled_back = Vec::new();
                for previous in started.iter().rev() {
                    match previous.stop_forced().await {
                        Ok(_) => rolled_back.push(previous.name().to_string()),
                        Err(stop_err) => error!(
                            cluster = %previous.name(),
                            error = %stop_err,
                            "Failed to roll back cluster"
                        ),
                    }
                }

                return Err(HostletError::SystemStartFailed {
                    cluster: cluster.name().to_string(),
                    source: Box::new(e),
                    rolled_back,
                });
            }

            started.push(cluster);
        }

        info!(clusters = started.len(), "System started");
        Ok(())
    }

    /// Stop every cluster in reverse order, best effort
    pub async fn stop_all(&self) -> HostletResult<()> {
        let mut failures = Vec::new();

        for cluster in self.clusters.iter().rev() {
            if let Err(e) = cluster.stop().await {
                warn!(cluster = %cluster.name(), error = %e, "Cluster stop failed, continuing");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            info!("System stopped");
            Ok(())
        } else {
            Err(HostletError::SystemOperationFailed {
                operation: "stop".to_string(),
                failures,
            })
        }
    }

    /// Destroy every cluster and clear the system's ledger entries
    pub async fn destroy_all(&self, confirmed: bool) -> HostletResult<()> {
        if !confirmed {
            return Err(HostletError::ConfirmationRequired(
                "destroying the system removes every VM definition".to_string(),
            ));
        }

        let mut failures = Vec::new();
        for cluster in self.clusters.iter().rev() {
            if let Err(e) = cluster.destroy().await {
                warn!(cluster = %cluster.name(), error = %e, "Cluster destroy failed, continuing");
                failures.push(e);
            }
        }

        if !failures.is_empty() {
            return Err(HostletError::SystemOperationFailed {
                operation: "destroy".to_string(),
                failures,
            });
        }

        let cleared = self
            .vms
            .allocator()
            .ledger()
            .clear_where(|owner| self.owns(owner))?;
        info!(cleared = cleared.len(), "System destroyed");
        Ok(())
    }

    /// Whether an owner is one of this system's VMs or clusters
    fn owns(&self, owner: &Owner) -> bool {
        match owner {
            Owner::Vm(name) => self.clusters.iter().any(|c| c.declares(name)),
            Owner::Cluster(name) => self.clusters.iter().any(|c| c.name() == name),
        }
    }

    /// Aggregate status of every cluster plus the ledger; read-only
    pub async fn status_all(&self) -> HostletResult<SystemStatus> {
        let mut records = Vec::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            records.push(cluster.record().await?);
        }

        let ledger = self.vms.allocator().snapshot()?;
        let clusters: Vec<ClusterSummary> = records
            .iter()
            .map(|r| ClusterSummary::new(r, &ledger))
            .collect();
        let statuses: Vec<_> = clusters.iter().map(|c| c.status).collect();
        let grace = self.config.ledger.reservation_grace();

        Ok(SystemStatus {
            health: SystemHealth::from_statuses(&statuses),
            clusters,
            warnings: find_inconsistencies(&records, &ledger, grace),
            topology: device_summary(&self.config.clusters),
            ledger,
        })
    }

    /// Compare the ledger with live state, optionally releasing stale entries
    pub async fn reconcile(&self, release_stale: bool) -> HostletResult<Vec<Inconsistency>> {
        let mut records = Vec::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            records.push(cluster.record().await?);
        }

        let ledger = self.vms.allocator().snapshot()?;
        let grace = self.config.ledger.reservation_grace();
        let found = find_inconsistencies(&records, &ledger, grace);

        for inconsistency in &found {
            warn!(
                device = %inconsistency.device,
                owner = %inconsistency.owner,
                observed = %inconsistency.observed,
                "Ledger inconsistency"
            );
            if release_stale {
                self.vms
                    .allocator()
                    .release_held_by(&inconsistency.device, &inconsistency.owner)?;
            }
        }

        Ok(found)
    }

    /// Start a single VM wherever it is declared
    pub async fn start_vm(&self, name: &str) -> HostletResult<VmDescriptor> {
        self.find_vm(name)?.start_vm(name).await
    }

    /// Stop a single VM wherever it is declared
    pub async fn stop_vm(&self, name: &str, force: bool) -> HostletResult<VmDescriptor> {
        self.find_vm(name)?.stop_vm(name, force).await
    }

    /// Restart a single VM wherever it is declared
    pub async fn restart_vm(&self, name: &str) -> HostletResult<VmDescriptor> {
        self.find_vm(name)?.restart_vm(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, Fixture};
    use hostlet_core::{ClusterStatus, DomainState};
    use hostlet_runtime::HypervisorCall;

    #[tokio::test]
    async fn test_start_order_and_stop_order() {
        let fx = Fixture::new();
        let system = fx.system();

        system.start_all().await.unwrap();
        system.stop_all().await.unwrap();

        let calls = fx.hypervisor.calls();
        let start_pos = |vm: &str| {
            calls
                .iter()
                .position(|c| *c == HypervisorCall::Start(vm.to_string()))
                .unwrap()
        };
        let stop_pos = |vm: &str| {
            calls
                .iter()
                .position(|c| matches!(c, HypervisorCall::Stop { name, .. } if name == vm))
                .unwrap()
        };

        assert!(start_pos("hpc-compute-01") < start_pos("cloud-controller"));
        assert!(stop_pos("cloud-controller") < stop_pos("hpc-controller"));
        assert!(fx.allocator.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inference_failure_rolls_back_training() {
        let fx = Fixture::new();
        fx.hypervisor.fail_start("cloud-controller");
        let system = fx.system();

        match system.start_all().await {
            Err(HostletError::SystemStartFailed {
                cluster,
                rolled_back,
                ..
            }) => {
                assert_eq!(cluster, "cloud");
                assert_eq!(rolled_back, vec!["hpc"]);
            }
            other => panic!("expected system start failure, got {:?}", other),
        }

        assert!(fx.hypervisor.running().is_empty());
        assert!(fx.allocator.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_requires_confirmation() {
        let fx = Fixture::new();
        let system = fx.system();
        system.start_all().await.unwrap();

        assert!(matches!(
            system.destroy_all(false).await,
            Err(HostletError::ConfirmationRequired(_))
        ));
        assert_eq!(fx.hypervisor.running().len(), 4);

        fx.allocator
            .try_allocate(&addr("0000:09:00.0"), &Owner::vm("unrelated"))
            .unwrap();
        system.destroy_all(true).await.unwrap();

        let status = system.status_all().await.unwrap();
        assert!(status
            .clusters
            .iter()
            .all(|c| c.status == ClusterStatus::Absent));
        let ledger = fx.allocator.snapshot().unwrap();
        assert_eq!(ledger.held_by(&Owner::vm("unrelated")), vec![addr("0000:09:00.0")]);
        assert_eq!(ledger.allocations.len(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_topology_and_health() {
        let fx = Fixture::new();
        let system = fx.system();

        let status = system.status_all().await.unwrap();
        assert_eq!(status.health, SystemHealth::Stopped);
        assert_eq!(status.topology.shared.len(), 1);
        assert_eq!(status.clusters[0].name, "hpc");

        system.cluster("hpc").unwrap().start().await.unwrap();
        let status = system.status_all().await.unwrap();
        assert_eq!(status.health, SystemHealth::Mixed);

        system.cluster("cloud").unwrap().start().await.unwrap();
        let status = system.status_all().await.unwrap();
        assert_eq!(status.health, SystemHealth::Running);
        assert!(status.warnings.is_empty());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["health"], "running");
    }

    #[tokio::test]
    async fn test_reconcile_releases_stale_entries() {
        let fx = Fixture::new();
        let system = fx.system();
        system.start_all().await.unwrap();
        fx.hypervisor.set_state("hpc-compute-02", DomainState::ShutOff);

        let found = system.reconcile(false).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(fx.holder("0000:02:00.0"), Some(Owner::vm("hpc-compute-02")));

        let found = system.reconcile(true).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(fx.holder("0000:02:00.0"), None);
        assert_eq!(fx.holder("0000:01:00.0"), Some(Owner::vm("hpc-compute-01")));
        assert!(system.reconcile(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_vm_routes_to_cluster() {
        let fx = Fixture::new();
        let system = fx.system();

        assert_eq!(system.find_vm("cloud-gpu-worker-01").unwrap().name(), "cloud");
        assert!(matches!(system.find_vm("nope"), Err(HostletError::VmNotFound(_))));
        assert!(matches!(system.cluster("nope"), Err(HostletError::ClusterNotFound(_))));
    }

    #[tokio::test]
    async fn test_reconcile_keeps_in_flight_reservation() {
        let fx = Fixture::new();
        let system = fx.system();
        fx.allocator
            .try_allocate(&addr("0000:02:00.0"), &Owner::cluster("hpc"))
            .unwrap();

        assert!(system.reconcile(true).await.unwrap().is_empty());
        assert_eq!(fx.holder("0000:02:00.0"), Some(Owner::cluster("hpc")));

        let mut config = fx.config();
        config.ledger.reservation_grace_secs = 0;
        let impatient = SystemCoordinator::new(config, fx.coordinator()).unwrap();
        assert_eq!(impatient.reconcile(true).await.unwrap().len(), 1);
        assert_eq!(fx.holder("0000:02:00.0"), None);
    }
}
