//! hostlet CLI
//!
//! Command-line interface for coordinating GPU passthrough between co-hosted
//! VM clusters. Every invocation re-derives state from the hypervisor and the
//! shared ledger file, so concurrent invocations stay consistent.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hostlet_core::{HostConfig, LoggingConfig, PciAddress};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::filter::{Directive, EnvFilter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::FmtSubscriber;

/// hostlet - GPU passthrough coordinator for co-hosted VM clusters
#[derive(Parser, Debug)]
#[command(name = "hostlet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Host configuration file
    #[arg(
        short,
        long,
        default_value = "hostlet.toml",
        env = "HOSTLET_CONFIG",
        global = true
    )]
    config: PathBuf,

    /// Override the ledger path from the configuration
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Operate on every cluster in order
    System {
        #[command(subcommand)]
        action: SystemAction,
    },

    /// Operate on one cluster
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },

    /// Operate on one VM
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },

    /// Inspect and repair device ownership
    Gpu {
        #[command(subcommand)]
        action: GpuAction,
    },

    /// Validate the configuration and probe declared devices
    Validate,
}

#[derive(Subcommand, Debug)]
enum SystemAction {
    /// Start the training cluster, then the inference cluster
    Start,
    /// Stop the inference cluster, then the training cluster
    Stop,
    /// Show every cluster, the ledger and the device topology
    Status,
    /// Destroy every VM and clear the system's ledger entries
    Destroy {
        /// Confirm destruction
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ClusterAction {
    /// Provision the cluster and start its auto-start VMs
    Start {
        /// Cluster name
        name: String,
    },
    /// Stop every VM of the cluster
    Stop {
        /// Cluster name
        name: String,
    },
    /// Show the cluster's VMs
    Status {
        /// Cluster name
        name: String,
    },
    /// Stop the cluster and remove its VM definitions
    Destroy {
        /// Cluster name
        name: String,

        /// Confirm destruction
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum VmAction {
    /// Start a VM, allocating its device
    Start {
        /// VM name
        name: String,
    },
    /// Stop a VM, releasing its device
    Stop {
        /// VM name
        name: String,

        /// Power off immediately instead of a graceful shutdown
        #[arg(long)]
        force: bool,
    },
    /// Stop then start a VM
    Restart {
        /// VM name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum GpuAction {
    /// Show devices declared by more than one cluster
    Conflicts,
    /// Show the ownership ledger
    Ledger,
    /// Release a device regardless of its holder
    Release {
        /// PCI address (e.g. 0000:01:00.0)
        pci: PciAddress,
    },
    /// Compare the ledger with live VM state
    Reconcile {
        /// Release every stale entry found
        #[arg(long)]
        release_stale: bool,
    },
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level. Logs go to stderr (or the
/// configured file) so `--json` output on stdout stays parseable.
fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let directive: Directive = level
        .parse()
        .with_context(|| format!("Invalid log level '{}'", level))?;

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            install_subscriber(Mutex::new(file), directive, &config.format, false)
        }
        None => install_subscriber(std::io::stderr, directive, &config.format, true),
    }
}

fn install_subscriber<W>(writer: W, directive: Directive, format: &str, ansi: bool) -> anyhow::Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer);

    if format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = HostConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(ledger) = cli.ledger {
        config.ledger.path = ledger;
    }

    init_logging(&config.logging, cli.verbose)?;

    let out = commands::Output { json: cli.json };

    match cli.command {
        Commands::Validate => commands::validate(&out, &config)?,
        Commands::System { action } => {
            let system = commands::build_system(&config)?;
            match action {
                SystemAction::Start => commands::system_start(&out, &system).await?,
                SystemAction::Stop => commands::system_stop(&out, &system).await?,
                SystemAction::Status => commands::system_status(&out, &system).await?,
                SystemAction::Destroy { yes } => {
                    commands::system_destroy(&out, &system, yes).await?
                }
            }
        }
        Commands::Cluster { action } => {
            let system = commands::build_system(&config)?;
            match action {
                ClusterAction::Start { name } => {
                    commands::cluster_start(&out, &system, &name).await?
                }
                ClusterAction::Stop { name } => commands::cluster_stop(&out, &system, &name).await?,
                ClusterAction::Status { name } => {
                    commands::cluster_status(&out, &system, &name).await?
                }
                ClusterAction::Destroy { name, yes } => {
                    commands::cluster_destroy(&out, &system, &name, yes).await?
                }
            }
        }
        Commands::Vm { action } => {
            let system = commands::build_system(&config)?;
            match action {
                VmAction::Start { name } => commands::vm_start(&out, &system, &name).await?,
                VmAction::Stop { name, force } => {
                    commands::vm_stop(&out, &system, &name, force).await?
                }
                VmAction::Restart { name } => commands::vm_restart(&out, &system, &name).await?,
            }
        }
        Commands::Gpu { action } => {
            let system = commands::build_system(&config)?;
            match action {
                GpuAction::Conflicts => commands::gpu_conflicts(&out, &system)?,
                GpuAction::Ledger => commands::gpu_ledger(&out, &system)?,
                GpuAction::Release { pci } => commands::gpu_release(&out, &system, &pci)?,
                GpuAction::Reconcile { release_stale } => {
                    commands::gpu_reconcile(&out, &system, release_stale).await?
                }
            }
        }
    }

    Ok(())
}
