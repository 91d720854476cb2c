//! Standalone driver: boot one function microVM cold or from a snapshot,
//! print its guest address, wait, then tear it down.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use firesnap_common::{DEFAULT_MEM_SIZE_MIB, DEFAULT_VCPU_COUNT};
use firesnap_executor::hypervisor::HypervisorClient;
use firesnap_executor::network::NetworkManager;
use firesnap_executor::patch::RsyncPatcher;
use firesnap_executor::runtime::RuntimeClient;
use firesnap_executor::snapshots::SnapshotManager;
use firesnap_executor::Orchestrator;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

/// Boot function microVMs cold or from captured snapshots.
#[derive(Parser)]
#[command(name = "firesnap")]
struct Cli {
    /// Virtual machine identifier
    #[arg(long)]
    id: String,

    /// Container image reference; required unless --boot-from-snap
    #[arg(long)]
    image: Option<String>,

    /// Boot from a previously captured snapshot
    #[arg(long)]
    boot_from_snap: bool,

    /// Restored container device path; required with --boot-from-snap
    #[arg(long)]
    container_snap_path: Option<PathBuf>,

    /// Snapshot key; defaults to the VM identifier
    #[arg(long)]
    revision: Option<String>,

    /// Capture a snapshot under the revision before shutdown
    #[arg(long)]
    capture: bool,

    /// Snapshot registry directory
    #[arg(long, default_value = "/var/lib/firesnap/snapshots")]
    base_dir: PathBuf,

    /// Combined snapshot capacity in MiB
    #[arg(long, default_value_t = 20 * 1024)]
    capacity_mib: u64,

    /// Container runtime service socket
    #[arg(long, default_value = "/run/firesnap/runtime.sock")]
    runtime_sock: String,

    /// Hypervisor service socket
    #[arg(long, default_value = "/run/firesnap/hypervisor.sock")]
    hypervisor_sock: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let revision = cli.revision.clone().unwrap_or_else(|| cli.id.clone());

    let snapshots = SnapshotManager::new(&cli.base_dir, cli.capacity_mib);
    snapshots
        .recover()
        .await
        .context("recovering snapshot registry")?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(RuntimeClient::new(cli.runtime_sock.clone())),
        Arc::new(HypervisorClient::new(cli.hypervisor_sock.clone())),
        NetworkManager::new(),
        snapshots,
        Arc::new(RsyncPatcher),
    ));

    let instance = if cli.boot_from_snap {
        let container_snap_path = cli
            .container_snap_path
            .as_deref()
            .context("--container-snap-path is required with --boot-from-snap")?;
        orchestrator
            .boot_vm_from_device(&cli.id, &revision, container_snap_path)
            .await?
    } else {
        let image = cli
            .image
            .as_deref()
            .context("--image is required unless --boot-from-snap is set")?;
        orchestrator
            .start_vm_with_id(&cli.id, image, &revision, DEFAULT_MEM_SIZE_MIB, DEFAULT_VCPU_COUNT)
            .await?
    };

    info!(vm_id = %instance.vm_id, guest_ip = %instance.guest_ip, "VM started");
    println!("VM available at IP: {}", instance.guest_ip);
    println!("Press Enter to stop");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading from stdin")?;

    let mut failure: Option<anyhow::Error> = None;

    if cli.capture && !cli.boot_from_snap {
        info!(revision = %revision, "capturing snapshot");
        match orchestrator.create_snapshot(&instance.vm_id, &revision).await {
            Ok(snapshot) => {
                println!("Snapshot stored under {}", snapshot.base_dir().display())
            }
            Err(e) => {
                error!(error = %e, "snapshot capture failed");
                failure.get_or_insert(e.into());
            }
        }
    }

    if let Err(e) = orchestrator.stop_vm(&instance.vm_id).await {
        error!(error = %e, "failed to stop VM");
        failure.get_or_insert(e.into());
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
