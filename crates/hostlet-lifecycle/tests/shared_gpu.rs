//! End-to-end: two clusters declaring the same GPU

use hostlet_core::{ClusterStatus, HostConfig, HostletError, Owner, PciAddress, VmState};
use hostlet_ledger::{Ledger, ResourceAllocator};
use hostlet_lifecycle::{SystemCoordinator, VmCoordinator};
use hostlet_runtime::{Hypervisor, SimulatedHypervisor};
use std::path::Path;
use std::sync::Arc;

const CONFIG: &str = r#"
[hypervisor]
kind = "simulated"

[[clusters]]
name = "hpc"
role = "training"

[[clusters.vms]]
name = "hpc-controller"

[[clusters.vms]]
name = "hpc-compute-01"
[clusters.vms.device]
pci_address = "0000:01:00.0"
vendor_id = "10de"
product_id = "2204"
model = "NVIDIA RTX A6000"

[[clusters]]
name = "cloud"
role = "inference"

[[clusters.vms]]
name = "cloud-controller"

[[clusters.vms]]
name = "cloud-gpu-worker-01"
auto_start = false
[clusters.vms.device]
pci_address = "0000:01:00.0"
"#;

/// A fresh coordinator over shared host state, as a separate CLI invocation would build
fn invocation(hypervisor: &Arc<SimulatedHypervisor>, ledger_path: &Path) -> SystemCoordinator {
    let config = HostConfig::from_toml_str(CONFIG).unwrap();
    let hypervisor: Arc<dyn Hypervisor> = hypervisor.clone();
    let allocator = ResourceAllocator::new(Ledger::new(ledger_path));
    SystemCoordinator::new(config, VmCoordinator::new(hypervisor, allocator)).unwrap()
}

fn holders(ledger_path: &Path) -> Vec<(PciAddress, Owner)> {
    Ledger::new(ledger_path)
        .snapshot()
        .unwrap()
        .allocations
        .into_iter()
        .map(|(device, entry)| (device, entry.owner))
        .collect()
}

#[tokio::test]
async fn test_shared_gpu_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let hypervisor = Arc::new(SimulatedHypervisor::new());
    let gpu: PciAddress = "0000:01:00.0".parse().unwrap();

    let shared = invocation(&hypervisor, &ledger_path).shared_devices();
    assert_eq!(shared[&gpu], vec!["hpc", "cloud"]);

    // 1. Training cluster starts and its VM takes the GPU
    invocation(&hypervisor, &ledger_path)
        .cluster("hpc")
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(holders(&ledger_path), vec![(gpu.clone(), Owner::vm("hpc-compute-01"))]);

    // 2. Inference cluster starts without its manual GPU VM
    let record = invocation(&hypervisor, &ledger_path)
        .cluster("cloud")
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(record.status(), ClusterStatus::Running);
    assert_eq!(holders(&ledger_path), vec![(gpu.clone(), Owner::vm("hpc-compute-01"))]);

    // 3. Starting the GPU VM by hand names the current holder
    let err = invocation(&hypervisor, &ledger_path)
        .start_vm("cloud-gpu-worker-01")
        .await
        .unwrap_err();
    match &err {
        HostletError::ResourceConflict { owner, requester, .. } => {
            assert_eq!(owner, &Owner::vm("hpc-compute-01"));
            assert_eq!(requester, &Owner::vm("cloud-gpu-worker-01"));
        }
        other => panic!("expected resource conflict, got {:?}", other),
    }
    assert!(err.to_string().contains("stop vm:hpc-compute-01 first"));
    assert_eq!(
        hypervisor.domain_state("cloud-gpu-worker-01"),
        Some(hostlet_core::DomainState::ShutOff)
    );

    // 4. Once the training cluster stops, the GPU VM can start
    invocation(&hypervisor, &ledger_path)
        .cluster("hpc")
        .unwrap()
        .stop()
        .await
        .unwrap();
    assert!(holders(&ledger_path).is_empty());

    let vm = invocation(&hypervisor, &ledger_path)
        .start_vm("cloud-gpu-worker-01")
        .await
        .unwrap();
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(holders(&ledger_path), vec![(gpu.clone(), Owner::vm("cloud-gpu-worker-01"))]);

    // Restarting the training cluster now fails at the gate and creates nothing new
    let err = invocation(&hypervisor, &ledger_path)
        .cluster("hpc")
        .unwrap()
        .start()
        .await
        .unwrap_err();
    assert!(matches!(err, HostletError::ResourceConflict { .. }));
    assert_eq!(
        hypervisor.domain_state("hpc-compute-01"),
        Some(hostlet_core::DomainState::ShutOff)
    );

    let status = invocation(&hypervisor, &ledger_path).status_all().await.unwrap();
    assert!(status.warnings.is_empty());
}

#[tokio::test]
async fn test_system_start_with_shared_gpu() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let hypervisor = Arc::new(SimulatedHypervisor::new());

    let system = invocation(&hypervisor, &ledger_path);
    system.start_all().await.unwrap();

    let status = system.status_all().await.unwrap();
    assert!(status.clusters.iter().all(|c| c.status == ClusterStatus::Running));

    let worker = status.clusters[1]
        .vms
        .iter()
        .find(|vm| vm.name == "cloud-gpu-worker-01")
        .unwrap();
    assert_eq!(worker.device_holder, Some(Owner::vm("hpc-compute-01")));

    system.stop_all().await.unwrap();
    assert!(holders(&ledger_path).is_empty());
}
