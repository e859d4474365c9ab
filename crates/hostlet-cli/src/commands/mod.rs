//! CLI commands implementation

use anyhow::{bail, Result};
use hostlet_core::{
    detect_shared_devices, device_summary, probe_device, DeviceSummary, DeviceUsage, HostConfig,
    HostletError, PciAddress, SYSFS_PCI_DEVICES,
};
use hostlet_ledger::{Ledger, LedgerState, ResourceAllocator};
use hostlet_lifecycle::{ClusterSummary, Inconsistency, SystemCoordinator, SystemStatus, VmCoordinator};
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;
use tracing::{info, warn};

/// Output settings shared by every command
pub struct Output {
    pub json: bool,
}

impl Output {
    /// Print a value as JSON, or its text rendering
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            print!("{}", text());
        }
        Ok(())
    }

    fn message(&self, text: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Message<'a> {
            message: &'a str,
        }
        self.emit(&Message { message: text }, || format!("{}\n", text))
    }
}

/// Build the system coordinator from configuration
pub fn build_system(config: &HostConfig) -> Result<SystemCoordinator> {
    let hypervisor = hostlet_runtime::from_config(&config.hypervisor);
    let allocator = ResourceAllocator::new(Ledger::new(&config.ledger.path));

    info!(
        hypervisor = hypervisor.name(),
        ledger = %config.ledger.path.display(),
        clusters = config.clusters.len(),
        "Loaded configuration"
    );

    Ok(SystemCoordinator::new(
        config.clone(),
        VmCoordinator::new(hypervisor, allocator),
    )?)
}

/// Start every cluster
pub async fn system_start(out: &Output, system: &SystemCoordinator) -> Result<()> {
    system.start_all().await?;
    system_status(out, system).await
}

/// Stop every cluster
pub async fn system_stop(out: &Output, system: &SystemCoordinator) -> Result<()> {
    system.stop_all().await?;
    out.message("System stopped")
}

/// Show system status
pub async fn system_status(out: &Output, system: &SystemCoordinator) -> Result<()> {
    let status = system.status_all().await?;
    out.emit(&status, || render_status(&status))
}

/// Destroy every cluster
pub async fn system_destroy(out: &Output, system: &SystemCoordinator, yes: bool) -> Result<()> {
    system.destroy_all(yes).await?;
    out.message("System destroyed")
}

/// Start one cluster
pub async fn cluster_start(out: &Output, system: &SystemCoordinator, name: &str) -> Result<()> {
    let record = system.cluster(name)?.start().await?;
    let summary = ClusterSummary::new(&record, &system.allocator().snapshot()?);
    out.emit(&summary, || render_cluster(&summary))
}

/// Stop one cluster
pub async fn cluster_stop(out: &Output, system: &SystemCoordinator, name: &str) -> Result<()> {
    let record = system.cluster(name)?.stop().await?;
    let summary = ClusterSummary::new(&record, &system.allocator().snapshot()?);
    out.emit(&summary, || render_cluster(&summary))
}

/// Show one cluster
pub async fn cluster_status(out: &Output, system: &SystemCoordinator, name: &str) -> Result<()> {
    let record = system.cluster(name)?.record().await?;
    let summary = ClusterSummary::new(&record, &system.allocator().snapshot()?);
    out.emit(&summary, || render_cluster(&summary))
}

/// Destroy one cluster
pub async fn cluster_destroy(
    out: &Output,
    system: &SystemCoordinator,
    name: &str,
    yes: bool,
) -> Result<()> {
    let cluster = system.cluster(name)?;
    if !yes {
        return Err(HostletError::ConfirmationRequired(format!(
            "destroying cluster '{}' removes its VM definitions; pass --yes",
            name
        ))
        .into());
    }
    cluster.destroy().await?;
    out.message(&format!("Cluster '{}' destroyed", name))
}

/// Start one VM
pub async fn vm_start(out: &Output, system: &SystemCoordinator, name: &str) -> Result<()> {
    let vm = system.start_vm(name).await?;
    out.message(&format!("VM '{}' is {}", vm.name, vm.state))
}

/// Stop one VM
pub async fn vm_stop(out: &Output, system: &SystemCoordinator, name: &str, force: bool) -> Result<()> {
    let vm = system.stop_vm(name, force).await?;
    out.message(&format!("VM '{}' is {}", vm.name, vm.state))
}

/// Restart one VM
pub async fn vm_restart(out: &Output, system: &SystemCoordinator, name: &str) -> Result<()> {
    let vm = system.restart_vm(name).await?;
    out.message(&format!("VM '{}' is {}", vm.name, vm.state))
}

/// Show devices declared by more than one cluster
pub fn gpu_conflicts(out: &Output, system: &SystemCoordinator) -> Result<()> {
    let summary = device_summary(&system.config().clusters);
    out.emit(&summary, || render_topology(&summary))
}

/// Show the ownership ledger
pub fn gpu_ledger(out: &Output, system: &SystemCoordinator) -> Result<()> {
    let ledger = system.allocator().snapshot()?;
    out.emit(&ledger, || render_ledger(&ledger))
}

/// Release a device whoever holds it
pub fn gpu_release(out: &Output, system: &SystemCoordinator, device: &PciAddress) -> Result<()> {
    match system.allocator().release(device)? {
        Some(entry) => {
            warn!(device = %device, owner = %entry.owner, "Manually released device");
            out.message(&format!("Released {} (was held by {})", device, entry.owner))
        }
        None => out.message(&format!("{} is not allocated", device)),
    }
}

/// Compare the ledger with live state
pub async fn gpu_reconcile(out: &Output, system: &SystemCoordinator, release_stale: bool) -> Result<()> {
    let found = system.reconcile(release_stale).await?;
    out.emit(&found, || render_inconsistencies(&found, release_stale))
}

/// Result of probing one declared device
#[derive(Debug, Serialize)]
pub struct DeviceCheck {
    pub device: PciAddress,
    pub vms: Vec<String>,
    pub warnings: Vec<String>,
}

/// Output of `hostlet validate`
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub clusters: usize,
    pub shared: DeviceUsage,
    pub devices: Vec<DeviceCheck>,
}

/// Check every declared device against the host's sysfs
pub fn check_devices(config: &HostConfig, sysfs_root: &Path) -> Vec<DeviceCheck> {
    let mut checks: Vec<DeviceCheck> = Vec::new();

    for vm in config.clusters.iter().flat_map(|c| c.vms.iter()) {
        let Some(declared) = &vm.device else {
            continue;
        };
        if let Some(check) = checks.iter_mut().find(|c| c.device == declared.pci_address) {
            check.vms.push(vm.name.clone());
            continue;
        }

        let mut warnings = Vec::new();
        match probe_device(sysfs_root, &declared.pci_address) {
            None => warnings.push("device not present on this host".to_string()),
            Some(found) => {
                if !found.is_vfio_bound() {
                    warnings.push(format!(
                        "bound to {} instead of vfio-pci",
                        found.driver.as_deref().unwrap_or("no driver")
                    ));
                }
                if let Some(vendor) = &declared.vendor_id {
                    if !vendor.eq_ignore_ascii_case(&found.vendor_id) {
                        warnings.push(format!(
                            "vendor id is {}, configuration declares {}",
                            found.vendor_id, vendor
                        ));
                    }
                }
                if let Some(product) = &declared.product_id {
                    if !product.eq_ignore_ascii_case(&found.product_id) {
                        warnings.push(format!(
                            "product id is {}, configuration declares {}",
                            found.product_id, product
                        ));
                    }
                }
            }
        }

        checks.push(DeviceCheck {
            device: declared.pci_address.clone(),
            vms: vec![vm.name.clone()],
            warnings,
        });
    }

    checks
}

/// Validate the configuration and probe declared devices
pub fn validate(out: &Output, config: &HostConfig) -> Result<()> {
    if let Err(e) = config.validate() {
        bail!("Configuration is invalid: {}", e);
    }

    let devices = check_devices(config, Path::new(SYSFS_PCI_DEVICES));
    for check in &devices {
        for warning in &check.warnings {
            warn!(device = %check.device, "{}", warning);
        }
    }

    let report = ValidationReport {
        clusters: config.clusters.len(),
        shared: detect_shared_devices(&config.clusters),
        devices,
    };
    out.emit(&report, || render_validation(&report))
}

fn render_status(status: &SystemStatus) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "System: {}", status.health);

    for cluster in &status.clusters {
        let _ = writeln!(text);
        text.push_str(&render_cluster(cluster));
    }

    let _ = writeln!(text);
    text.push_str(&render_ledger(&status.ledger));

    if !status.topology.shared.is_empty() {
        let _ = writeln!(text);
        text.push_str(&render_topology(&status.topology));
    }

    if !status.warnings.is_empty() {
        let _ = writeln!(text);
        text.push_str(&render_inconsistencies(&status.warnings, false));
    }

    text
}

fn render_cluster(cluster: &ClusterSummary) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "Cluster '{}' ({}): {}",
        cluster.name, cluster.role, cluster.status
    );
    let _ = writeln!(
        text,
        "  {:<28} {:<10} {:<6} {:<14} {}",
        "VM", "STATE", "AUTO", "DEVICE", "HOLDER"
    );

    for vm in &cluster.vms {
        let device = vm
            .device
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        let holder = vm
            .device_holder
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            text,
            "  {:<28} {:<10} {:<6} {:<14} {}",
            vm.name,
            vm.state.to_string(),
            if vm.auto_start { "yes" } else { "no" },
            device,
            holder
        );
    }

    text
}

fn render_ledger(ledger: &LedgerState) -> String {
    let mut text = String::new();
    if ledger.is_empty() {
        let _ = writeln!(text, "Ledger: no devices allocated");
        return text;
    }

    let _ = writeln!(text, "Ledger:");
    for (device, entry) in &ledger.allocations {
        let _ = writeln!(
            text,
            "  {:<14} {:<32} since {}",
            device.to_string(),
            entry.owner.to_string(),
            entry.acquired_at.to_rfc3339()
        );
    }
    text
}

fn render_topology(summary: &DeviceSummary) -> String {
    let mut text = String::new();

    if summary.shared.is_empty() {
        let _ = writeln!(text, "No devices are shared between clusters");
    } else {
        let _ = writeln!(text, "Shared devices (one holder at a time):");
        for (device, clusters) in &summary.shared {
            let _ = writeln!(text, "  {:<14} {}", device.to_string(), clusters.join(", "));
        }
    }

    if !summary.exclusive.is_empty() {
        let _ = writeln!(text, "Exclusive devices:");
        for (device, clusters) in &summary.exclusive {
            let _ = writeln!(text, "  {:<14} {}", device.to_string(), clusters.join(", "));
        }
    }

    text
}

fn render_inconsistencies(found: &[Inconsistency], released: bool) -> String {
    let mut text = String::new();
    if found.is_empty() {
        let _ = writeln!(text, "Ledger is consistent with live VM state");
        return text;
    }

    let _ = writeln!(text, "Ledger inconsistencies:");
    for inconsistency in found {
        let _ = writeln!(text, "  {}", inconsistency.to_error());
    }
    if released {
        let _ = writeln!(text, "Released {} stale entries", found.len());
    }
    text
}

fn render_validation(report: &ValidationReport) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Configuration valid: {} clusters", report.clusters);

    for (device, clusters) in &report.shared {
        let _ = writeln!(
            text,
            "  shared: {} declared by {}",
            device,
            clusters.join(", ")
        );
    }
    for check in &report.devices {
        for warning in &check.warnings {
            let _ = writeln!(
                text,
                "  warning: {} ({}): {}",
                check.device,
                check.vms.join(", "),
                warning
            );
        }
    }

    text
}
