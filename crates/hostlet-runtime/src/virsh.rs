//! libvirt hypervisor driven through the `virsh` command line
//!
//! Every call spawns one `virsh -c <uri>` subprocess. Domains are addressed
//! by name.

use async_trait::async_trait;
use hostlet_core::{DomainState, HostletError, HostletResult, HypervisorConfig, VmHandle, VmSpec};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::traits::Hypervisor;

/// Raw result of one virsh invocation
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Parse the output of `virsh domstate`
pub fn parse_domstate(output: &str) -> DomainState {
    match output.lines().next().unwrap_or_default().trim() {
        "running" | "idle" | "blocked" => DomainState::Running,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::InShutdown,
        "shut off" => DomainState::ShutOff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::Suspended,
        _ => DomainState::Unknown,
    }
}

fn is_domain_missing(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

/// virsh-based hypervisor
pub struct VirshHypervisor {
    config: HypervisorConfig,
}

impl VirshHypervisor {
    /// Create a new virsh hypervisor
    pub fn new(config: HypervisorConfig) -> Self {
        Self { config }
    }

    /// Full argument list for a virsh subcommand
    fn args<'a>(&'a self, subcommand: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["-c", self.config.uri.as_str()];
        args.extend_from_slice(subcommand);
        args
    }

    /// Build the command for a virsh subcommand
    fn build_command(&self, subcommand: &[&str]) -> Command {
        let mut cmd = Command::new(&self.config.virsh_path);
        cmd.args(self.args(subcommand));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    async fn exec(&self, subcommand: &[&str]) -> HostletResult<CommandOutput> {
        debug!(args = ?subcommand, "Running virsh");

        let output = self.build_command(subcommand).output().await.map_err(|e| {
            HostletError::Hypervisor(format!(
                "Failed to run {}: {}",
                self.config.virsh_path.display(),
                e
            ))
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run(&self, subcommand: &[&str]) -> HostletResult<String> {
        let output = self.exec(subcommand).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(HostletError::Hypervisor(format!(
                "virsh {} failed: {}",
                subcommand.join(" "),
                output.stderr
            )))
        }
    }

    /// Poll until the domain is shut off or the shutdown timeout passes
    async fn wait_for_shutoff(&self, handle: &VmHandle) -> HostletResult<bool> {
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let deadline = Instant::now() + timeout;

        loop {
            if self.query_state(handle).await? == DomainState::ShutOff {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(
                    vm = %handle.name,
                    timeout_secs = timeout.as_secs(),
                    "Graceful shutdown timed out"
                );
                return Ok(false);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn provision(&self, spec: &VmSpec) -> HostletResult<VmHandle> {
        if let Some(definition) = &spec.definition {
            let path = definition.to_string_lossy();
            self.run(&["define", &*path]).await?;
            info!(vm = %spec.name, definition = %path, "Defined domain");
        }

        self.lookup(&spec.name).await?.ok_or_else(|| {
            HostletError::Hypervisor(format!(
                "Domain '{}' is not defined and no domain definition was configured",
                spec.name
            ))
        })
    }

    async fn start(&self, handle: &VmHandle) -> HostletResult<()> {
        let output = self.exec(&["start", handle.name.as_str()]).await?;
        if output.success || output.stderr.contains("already active") {
            info!(vm = %handle.name, "Started domain");
            Ok(())
        } else {
            Err(HostletError::Hypervisor(format!(
                "virsh start {} failed: {}",
                handle.name, output.stderr
            )))
        }
    }

    async fn stop(&self, handle: &VmHandle, force: bool) -> HostletResult<bool> {
        if self.query_state(handle).await? == DomainState::ShutOff {
            debug!(vm = %handle.name, "Domain already shut off");
            return Ok(true);
        }

        if force {
            self.run(&["destroy", handle.name.as_str()]).await?;
            info!(vm = %handle.name, "Force stopped domain");
            return Ok(self.query_state(handle).await? == DomainState::ShutOff);
        }

        self.run(&["shutdown", handle.name.as_str()]).await?;
        info!(vm = %handle.name, "Initiated graceful shutdown");
        self.wait_for_shutoff(handle).await
    }

    async fn query_state(&self, handle: &VmHandle) -> HostletResult<DomainState> {
        let output = self.run(&["domstate", handle.name.as_str()]).await?;
        Ok(parse_domstate(&output))
    }

    async fn destroy(&self, handle: &VmHandle) -> HostletResult<()> {
        if self.query_state(handle).await? != DomainState::ShutOff {
            self.run(&["destroy", handle.name.as_str()]).await?;
        }
        self.run(&["undefine", handle.name.as_str()]).await?;
        info!(vm = %handle.name, "Undefined domain");
        Ok(())
    }

    async fn lookup(&self, name: &str) -> HostletResult<Option<VmHandle>> {
        let output = self.exec(&["domuuid", name]).await?;
        if !output.success {
            if is_domain_missing(&output.stderr) {
                return Ok(None);
            }
            return Err(HostletError::Hypervisor(format!(
                "virsh domuuid {} failed: {}",
                name, output.stderr
            )));
        }

        let uuid = Uuid::parse_str(output.stdout.trim()).map_err(|e| {
            HostletError::Hypervisor(format!(
                "Unexpected domuuid output for '{}': {}",
                name, e
            ))
        })?;

        Ok(Some(VmHandle {
            name: name.to_string(),
            uuid,
        }))
    }

    fn name(&self) -> &'static str {
        "virsh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_domstate() {
        assert_eq!(parse_domstate("running\n\n"), DomainState::Running);
        assert_eq!(parse_domstate("shut off"), DomainState::ShutOff);
        assert_eq!(parse_domstate("in shutdown"), DomainState::InShutdown);
        assert_eq!(parse_domstate("pmsuspended"), DomainState::Suspended);
        assert_eq!(parse_domstate("crashed"), DomainState::Crashed);
        assert_eq!(parse_domstate(""), DomainState::Unknown);
    }

    #[test]
    fn test_build_args() {
        let config = HypervisorConfig {
            uri: "qemu:///session".to_string(),
            virsh_path: PathBuf::from("/usr/bin/virsh"),
            ..Default::default()
        };
        let hypervisor = VirshHypervisor::new(config);

        assert_eq!(
            hypervisor.args(&["domstate", "hpc-controller"]),
            vec!["-c", "qemu:///session", "domstate", "hpc-controller"]
        );
        assert_eq!(hypervisor.name(), "virsh");
    }

    #[test]
    fn test_domain_missing() {
        assert!(is_domain_missing(
            "error: failed to get domain 'cloud-gpu-worker-01'"
        ));
        assert!(!is_domain_missing("error: failed to connect to the hypervisor"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_hypervisor_error() {
        let config = HypervisorConfig {
            virsh_path: PathBuf::from("/nonexistent/hostlet-virsh"),
            ..Default::default()
        };
        let hypervisor = VirshHypervisor::new(config);

        let result = hypervisor.lookup("hpc-controller").await;
        assert!(matches!(result, Err(HostletError::Hypervisor(_))));
    }
}
