//! End-to-end VM lifecycle workflows.
//!
//! The orchestrator owns the runtime records of all live VMs and drives the
//! create / capture / restore / stop sequences across the block-device,
//! patch, network, and registry layers plus the two external services. Any
//! failure mid-start releases the partially acquired resources in reverse
//! order; stop keeps going past individual step failures and reports the
//! first error it saw.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use firesnap_common::{Error, MachineConfig, Result};
use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::devmapper;
use crate::hypervisor::{CreateSnapshotRequest, CreateVmRequest, Hypervisor, NetworkInterfaceSpec};
use crate::network::{NetworkConfig, NetworkManager};
use crate::patch::Patcher;
use crate::runtime::{
    single_mount_source, ContainerHandle, ContainerRuntime, ImageHandle, TaskHandle,
};
use crate::snapshots::{Snapshot, SnapshotInfo, SnapshotManager};

const DEFAULT_REGISTRY: &str = "docker.io/";
const NAMESERVERS: &[&str] = &["8.8.8.8"];

/// A started function VM as reported to callers.
#[derive(Debug, Clone)]
pub struct FuncInstance {
    pub vm_id: String,
    pub guest_ip: String,
    pub revision: String,
    pub snap_booted: bool,
    /// The committed snapshot backing a snapshot boot.
    pub snapshot: Option<Snapshot>,
}

/// Runtime record of one live VM. Container and task handles exist only on
/// cold-booted VMs.
#[derive(Clone)]
struct VmInfo {
    image_name: String,
    ctr_snap_key: Option<String>,
    ctr_snap_dev_path: PathBuf,
    snap_booted: bool,
    machine_cfg: MachineConfig,
    container: Option<ContainerHandle>,
    task: Option<TaskHandle>,
}

/// Resources acquired so far by a boot attempt, for reverse-order release.
#[derive(Default)]
struct BootState {
    snap_key: Option<String>,
    container: Option<ContainerHandle>,
    task: Option<TaskHandle>,
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    hypervisor: Arc<dyn Hypervisor>,
    network: NetworkManager,
    snapshots: SnapshotManager,
    patcher: Arc<dyn Patcher>,
    cached_images: Mutex<HashMap<String, Arc<OnceCell<ImageHandle>>>>,
    vms: Mutex<HashMap<String, VmInfo>>,
    /// External container id -> VM id, bound late via [`Self::insert_active`].
    active: Mutex<HashMap<String, String>>,
    leases: Mutex<HashMap<String, crate::runtime::Lease>>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        hypervisor: Arc<dyn Hypervisor>,
        network: NetworkManager,
        snapshots: SnapshotManager,
        patcher: Arc<dyn Patcher>,
    ) -> Self {
        Self {
            runtime,
            hypervisor,
            network,
            snapshots,
            patcher,
            cached_images: Mutex::new(HashMap::new()),
            vms: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    /// Identifiers of all live VMs.
    pub async fn list_vms(&self) -> Vec<String> {
        self.vms.lock().await.keys().cloned().collect()
    }

    /// Start a VM for `revision`, restoring from its snapshot when one is
    /// committed and cold-booting from `image` otherwise.
    pub async fn start_vm(
        &self,
        image: &str,
        revision: &str,
        mem_size_mib: u32,
        vcpu_count: u32,
    ) -> Result<FuncInstance> {
        let vm_id = Uuid::new_v4().to_string();
        self.start_vm_with_id(&vm_id, image, revision, mem_size_mib, vcpu_count)
            .await
    }

    #[instrument(skip(self))]
    pub async fn start_vm_with_id(
        &self,
        vm_id: &str,
        image: &str,
        revision: &str,
        mem_size_mib: u32,
        vcpu_count: u32,
    ) -> Result<FuncInstance> {
        if self.vms.lock().await.contains_key(vm_id) {
            return Err(Error::Conflict(format!("VM {vm_id} already exists")));
        }

        match self.snapshots.lookup(revision).await {
            Ok(snapshot) => {
                let guest_ip = self.snapshot_boot(vm_id, &snapshot).await?;
                info!(guest_ip = %guest_ip, "VM restored from snapshot");
                Ok(FuncInstance {
                    vm_id: vm_id.to_string(),
                    guest_ip,
                    revision: revision.to_string(),
                    snap_booted: true,
                    snapshot: Some(snapshot),
                })
            }
            Err(Error::NotFound(_)) => {
                info!("no committed snapshot for revision, cold booting");
                let machine_cfg = MachineConfig {
                    vcpu_count,
                    mem_size_mib,
                };
                let guest_ip = self.cold_boot(vm_id, image, machine_cfg).await?;
                info!(guest_ip = %guest_ip, "VM cold booted");
                Ok(FuncInstance {
                    vm_id: vm_id.to_string(),
                    guest_ip,
                    revision: revision.to_string(),
                    snap_booted: false,
                    snapshot: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Boot from a previously captured snapshot using a restored container
    /// device the caller prepared, bypassing the patch-apply path.
    #[instrument(skip(self))]
    pub async fn boot_vm_from_device(
        &self,
        vm_id: &str,
        revision: &str,
        container_snap_path: &Path,
    ) -> Result<FuncInstance> {
        if self.vms.lock().await.contains_key(vm_id) {
            return Err(Error::Conflict(format!("VM {vm_id} already exists")));
        }

        let snapshot = self.snapshots.lookup(revision).await?;
        let snap_info = snapshot.read_info()?;
        let machine_cfg = MachineConfig {
            vcpu_count: snap_info.vcpu_count,
            mem_size_mib: snap_info.mem_size_mib,
        };

        let netcfg = self.network.create_network(vm_id).await?;
        let mut request = self.vm_request(vm_id, machine_cfg, &netcfg);
        request.load_snapshot = true;
        request.mem_file_path = Some(snapshot.mem_file_path());
        request.snapshot_path = Some(snapshot.snap_file_path());
        request.container_snapshot_path = Some(container_snap_path.to_path_buf());

        if let Err(e) = self.hypervisor.create_vm(&request).await {
            if let Err(ne) = self.network.remove_network(vm_id).await {
                warn!(error = %ne, "failed to release network after boot failure");
            }
            return Err(e);
        }

        self.vms.lock().await.insert(
            vm_id.to_string(),
            VmInfo {
                image_name: snap_info.image,
                ctr_snap_key: None,
                ctr_snap_dev_path: container_snap_path.to_path_buf(),
                snap_booted: true,
                machine_cfg,
                container: None,
                task: None,
            },
        );

        Ok(FuncInstance {
            vm_id: vm_id.to_string(),
            guest_ip: netcfg.guest_ip(),
            revision: revision.to_string(),
            snap_booted: true,
            snapshot: Some(snapshot),
        })
    }

    /// Capture a restorable snapshot of a running VM under `revision`.
    ///
    /// The VM is paused across the memory dump and the patch extraction and
    /// resumed before the memory file is sparsified, keeping the paused
    /// interval short. Once the snapshot commits it stays committed: a
    /// resume failure is reported to the caller but does not roll it back.
    #[instrument(skip(self))]
    pub async fn create_snapshot(&self, vm_id: &str, revision: &str) -> Result<Snapshot> {
        let (image_name, ctr_snap_dev, machine_cfg) = {
            let vms = self.vms.lock().await;
            let vm = vms
                .get(vm_id)
                .ok_or_else(|| Error::NotFound(format!("unknown VM {vm_id}")))?;
            (
                vm.image_name.clone(),
                vm.ctr_snap_dev_path.clone(),
                vm.machine_cfg,
            )
        };

        info!("pausing VM");
        self.hypervisor.pause_vm(vm_id).await?;

        let snapshot = match self
            .snapshots
            .register(revision, machine_cfg.mem_size_mib as u64)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.resume_after_failure(vm_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .capture_artifacts(vm_id, &image_name, &ctr_snap_dev, &snapshot)
            .await
        {
            if let Err(re) = self.snapshots.remove(revision).await {
                warn!(error = %re, "failed to reclaim uncommitted snapshot");
            }
            self.resume_after_failure(vm_id).await;
            return Err(e);
        }

        info!("resuming VM");
        let resume_result = self.hypervisor.resume_vm(vm_id).await;
        if let Err(e) = &resume_result {
            error!(error = %e, "resuming VM failed; committing the snapshot anyway");
        }

        if let Err(e) = self.finish_capture(&snapshot, &image_name, machine_cfg).await {
            if let Err(re) = self.snapshots.remove(revision).await {
                warn!(error = %re, "failed to reclaim uncommitted snapshot");
            }
            return Err(e);
        }

        resume_result?;
        info!("snapshot captured");
        Ok(snapshot)
    }

    /// Stop the VM bound to `container_id` (or addressed directly by its VM
    /// identifier) and release its resources. Every step is attempted; the
    /// first error is returned.
    #[instrument(skip(self))]
    pub async fn stop_vm(&self, container_id: &str) -> Result<()> {
        let bound = self.active.lock().await.get(container_id).cloned();
        let vm_id = match bound {
            Some(vm_id) => vm_id,
            None => {
                if !self.vms.lock().await.contains_key(container_id) {
                    return Err(Error::NotFound(format!(
                        "no VM bound to container {container_id}"
                    )));
                }
                container_id.to_string()
            }
        };

        let vm = {
            let vms = self.vms.lock().await;
            vms.get(&vm_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("unknown VM {vm_id}")))?
        };

        let mut first_err: Option<Error> = None;
        let mut record = |step: &'static str, result: Result<()>| {
            if let Err(e) = result {
                error!(vm_id = %vm_id, step, error = %e, "stop step failed");
                first_err.get_or_insert(e);
            }
        };

        if !vm.snap_booted {
            if let (Some(task), Some(container)) = (&vm.task, &vm.container) {
                info!(vm_id = %vm_id, "killing container task");
                record("kill task", self.runtime.kill_task(task).await);
                record(
                    "wait for task exit",
                    self.runtime.wait_task(task).await.map(|status| {
                        info!(vm_id = %vm_id, status, "container task exited");
                    }),
                );
                record("delete task", self.runtime.delete_task(task).await);
                record(
                    "delete container",
                    self.runtime.delete_container(container, true).await,
                );
            }
        }

        info!(vm_id = %vm_id, "stopping VM");
        record("stop VM", self.hypervisor.stop_vm(&vm_id).await);

        if vm.snap_booted {
            if let Some(snap_key) = &vm.ctr_snap_key {
                record(
                    "remove container snapshot",
                    self.runtime.remove_snapshot(snap_key).await,
                );
            }
        }
        if let Some(snap_key) = &vm.ctr_snap_key {
            self.drop_lease(snap_key).await;
        }

        record("remove network", self.network.remove_network(&vm_id).await);

        self.active.lock().await.remove(container_id);
        self.vms.lock().await.remove(&vm_id);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bind the external container identifier to an instance so that a later
    /// [`Self::stop_vm`] with that identifier finds the VM.
    pub async fn insert_active(&self, container_id: &str, instance: &FuncInstance) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.contains_key(container_id) {
            return Err(Error::Conflict(format!(
                "container {container_id} is already bound to a VM"
            )));
        }
        active.insert(container_id.to_string(), instance.vm_id.clone());
        Ok(())
    }

    /// Stop every VM still registered. Used on shutdown.
    pub async fn tear_down(&self) {
        for vm_id in self.list_vms().await {
            if let Err(e) = self.stop_vm(&vm_id).await {
                error!(vm_id = %vm_id, error = %e, "failed to stop VM during teardown");
            }
        }
    }

    // --- boot paths ---

    async fn cold_boot(
        &self,
        vm_id: &str,
        image_name: &str,
        machine_cfg: MachineConfig,
    ) -> Result<String> {
        let netcfg = self.network.create_network(vm_id).await?;
        let mut state = BootState::default();
        match self
            .cold_boot_steps(vm_id, image_name, machine_cfg, &netcfg, &mut state)
            .await
        {
            Ok(vm) => {
                self.vms.lock().await.insert(vm_id.to_string(), vm);
                Ok(netcfg.guest_ip())
            }
            Err(e) => {
                error!(vm_id, error = %e, "cold boot failed, releasing partial resources");
                self.release_boot_state(vm_id, &state).await;
                Err(e)
            }
        }
    }

    async fn cold_boot_steps(
        &self,
        vm_id: &str,
        image_name: &str,
        machine_cfg: MachineConfig,
        netcfg: &NetworkConfig,
        state: &mut BootState,
    ) -> Result<VmInfo> {
        let image = self.get_image(image_name).await?;

        let snap_key = container_snap_key(vm_id);
        let dev_path = self.create_ctr_snapshot(&snap_key, &image).await?;
        state.snap_key = Some(snap_key.clone());

        info!(vm_id, "creating container");
        let container = self.runtime.create_container(vm_id, &snap_key, &image).await?;
        state.container = Some(container.clone());

        info!(vm_id, "creating container task");
        let task = self.runtime.create_task(&container).await?;
        state.task = Some(task.clone());
        self.runtime.start_task(&task).await?;

        info!(vm_id, "creating VM");
        self.hypervisor
            .create_vm(&self.vm_request(vm_id, machine_cfg, netcfg))
            .await?;

        Ok(VmInfo {
            image_name: image_name.to_string(),
            ctr_snap_key: Some(snap_key),
            ctr_snap_dev_path: dev_path,
            snap_booted: false,
            machine_cfg,
            container: Some(container),
            task: Some(task),
        })
    }

    async fn snapshot_boot(&self, vm_id: &str, snapshot: &Snapshot) -> Result<String> {
        let netcfg = self.network.create_network(vm_id).await?;
        let mut state = BootState::default();
        match self
            .snapshot_boot_steps(vm_id, snapshot, &netcfg, &mut state)
            .await
        {
            Ok(vm) => {
                self.vms.lock().await.insert(vm_id.to_string(), vm);
                Ok(netcfg.guest_ip())
            }
            Err(e) => {
                error!(vm_id, error = %e, "snapshot boot failed, releasing partial resources");
                self.release_boot_state(vm_id, &state).await;
                Err(e)
            }
        }
    }

    async fn snapshot_boot_steps(
        &self,
        vm_id: &str,
        snapshot: &Snapshot,
        netcfg: &NetworkConfig,
        state: &mut BootState,
    ) -> Result<VmInfo> {
        let snap_info = snapshot.read_info()?;
        let image = self.get_image(&snap_info.image).await?;
        let machine_cfg = MachineConfig {
            vcpu_count: snap_info.vcpu_count,
            mem_size_mib: snap_info.mem_size_mib,
        };

        let snap_key = container_snap_key(vm_id);
        let dev_path = self.create_ctr_snapshot(&snap_key, &image).await?;
        state.snap_key = Some(snap_key.clone());

        info!(vm_id, "restoring container snapshot");
        self.patcher
            .apply(&dev_path, &snapshot.patch_file_path())
            .await?;

        info!(vm_id, "creating VM from snapshot");
        let mut request = self.vm_request(vm_id, machine_cfg, netcfg);
        request.load_snapshot = true;
        request.mem_file_path = Some(snapshot.mem_file_path());
        request.snapshot_path = Some(snapshot.snap_file_path());
        request.container_snapshot_path = Some(dev_path.clone());
        self.hypervisor.create_vm(&request).await?;

        Ok(VmInfo {
            image_name: snap_info.image,
            ctr_snap_key: Some(snap_key),
            ctr_snap_dev_path: dev_path,
            snap_booted: true,
            machine_cfg,
            container: None,
            task: None,
        })
    }

    // --- capture ---

    async fn capture_artifacts(
        &self,
        vm_id: &str,
        image_name: &str,
        ctr_snap_dev: &Path,
        snapshot: &Snapshot,
    ) -> Result<()> {
        info!(vm_id, "creating VM snapshot");
        self.hypervisor
            .create_snapshot(&CreateSnapshotRequest {
                vm_id: vm_id.to_string(),
                mem_file_path: snapshot.mem_file_path(),
                snapshot_path: snapshot.snap_file_path(),
            })
            .await?;

        info!(vm_id, "extracting container snapshot patch");
        self.extract_patch(vm_id, image_name, ctr_snap_dev, &snapshot.patch_file_path())
            .await
    }

    /// Diff the paused VM's container device against a fresh snapshot of
    /// its image. The temporary image snapshot and its lease are removed on
    /// every path.
    async fn extract_patch(
        &self,
        vm_id: &str,
        image_name: &str,
        ctr_snap_dev: &Path,
        patch_path: &Path,
    ) -> Result<()> {
        let image = self.get_image(image_name).await?;
        let temp_key = image_snap_key(vm_id);
        let image_dev = self.create_ctr_snapshot(&temp_key, &image).await?;

        // The VM is paused, so its container device is quiescent and safe
        // to mount read-only on the host.
        let result = self
            .patcher
            .extract(&image_dev, ctr_snap_dev, patch_path)
            .await;

        if let Err(e) = self.runtime.remove_snapshot(&temp_key).await {
            warn!(vm_id, error = %e, "failed to remove temporary image snapshot");
        }
        self.drop_lease(&temp_key).await;
        result
    }

    async fn finish_capture(
        &self,
        snapshot: &Snapshot,
        image_name: &str,
        machine_cfg: MachineConfig,
    ) -> Result<()> {
        info!("sparsifying guest memory file");
        devmapper::sparsify(&snapshot.mem_file_path())?;

        snapshot.write_info(&SnapshotInfo {
            image: image_name.to_string(),
            mem_size_mib: machine_cfg.mem_size_mib,
            vcpu_count: machine_cfg.vcpu_count,
        })?;

        self.snapshots.commit(snapshot.revision()).await
    }

    async fn resume_after_failure(&self, vm_id: &str) {
        if let Err(e) = self.hypervisor.resume_vm(vm_id).await {
            error!(vm_id, error = %e, "failed to resume VM after capture failure");
        }
    }

    // --- shared helpers ---

    /// Image reference to registry URL, defaulting to the public registry
    /// when no registry host is present.
    fn image_url(image: &str) -> String {
        if image.contains('.') {
            image.to_string()
        } else {
            format!("{DEFAULT_REGISTRY}{image}")
        }
    }

    /// Cached image lookup. Concurrent pulls of one reference collapse into
    /// a single request; the cache never evicts.
    async fn get_image(&self, image_name: &str) -> Result<ImageHandle> {
        let cell = {
            let mut cache = self.cached_images.lock().await;
            cache.entry(image_name.to_string()).or_default().clone()
        };
        let handle = cell
            .get_or_try_init(|| async {
                let url = Self::image_url(image_name);
                info!(image = %url, "pulling image");
                self.runtime.pull_image(&url).await
            })
            .await?;
        Ok(handle.clone())
    }

    /// Prepare a copy-on-write container snapshot under `snap_key`, pinned
    /// by a lease, and return its block device path.
    async fn create_ctr_snapshot(&self, snap_key: &str, image: &ImageHandle) -> Result<PathBuf> {
        let lease = self.runtime.create_lease(snap_key).await?;
        self.leases
            .lock()
            .await
            .insert(snap_key.to_string(), lease.clone());

        let mounts = match self.runtime.prepare_snapshot(snap_key, image, &lease).await {
            Ok(mounts) => mounts,
            Err(e) => {
                self.drop_lease(snap_key).await;
                return Err(e);
            }
        };
        single_mount_source(snap_key, &mounts)
    }

    async fn drop_lease(&self, snap_key: &str) {
        let lease = self.leases.lock().await.remove(snap_key);
        if let Some(lease) = lease {
            if let Err(e) = self.runtime.delete_lease(&lease).await {
                warn!(snap_key, error = %e, "failed to delete lease");
            }
        }
    }

    async fn release_boot_state(&self, vm_id: &str, state: &BootState) {
        if let Some(task) = &state.task {
            if let Err(e) = self.runtime.kill_task(task).await {
                warn!(vm_id, error = %e, "failed to kill task during rollback");
            }
            if let Err(e) = self.runtime.delete_task(task).await {
                warn!(vm_id, error = %e, "failed to delete task during rollback");
            }
        }
        if let Some(container) = &state.container {
            if let Err(e) = self.runtime.delete_container(container, true).await {
                warn!(vm_id, error = %e, "failed to delete container during rollback");
            }
        } else if let Some(snap_key) = &state.snap_key {
            if let Err(e) = self.runtime.remove_snapshot(snap_key).await {
                warn!(vm_id, error = %e, "failed to remove container snapshot during rollback");
            }
        }
        if let Some(snap_key) = &state.snap_key {
            self.drop_lease(snap_key).await;
        }
        if let Err(e) = self.network.remove_network(vm_id).await {
            warn!(vm_id, error = %e, "failed to release network during rollback");
        }
    }

    fn vm_request(
        &self,
        vm_id: &str,
        machine_cfg: MachineConfig,
        netcfg: &NetworkConfig,
    ) -> CreateVmRequest {
        CreateVmRequest {
            vm_id: vm_id.to_string(),
            machine_cfg,
            network_interfaces: vec![NetworkInterfaceSpec {
                mac_address: netcfg.mac_address(),
                host_dev_name: netcfg.tap_name(),
                primary_addr: netcfg.container_cidr(),
                gateway_addr: netcfg.gateway_ip(),
                nameservers: NAMESERVERS.iter().map(|s| s.to_string()).collect(),
            }],
            netns_path: netcfg.namespace_path(),
            load_snapshot: false,
            mem_file_path: None,
            snapshot_path: None,
            container_snapshot_path: None,
        }
    }
}

fn container_snap_key(vm_id: &str) -> String {
    format!("{vm_id}-ctr-snap")
}

fn image_snap_key(vm_id: &str) -> String {
    format!("{vm_id}-img-snap")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_url_prepends_default_registry() {
        assert_eq!(
            Orchestrator::image_url("helloworld"),
            "docker.io/helloworld"
        );
        assert_eq!(
            Orchestrator::image_url("ghcr.io/x/helloworld:1"),
            "ghcr.io/x/helloworld:1"
        );
    }

    #[test]
    fn snapshot_keys_derive_from_vm_id() {
        assert_eq!(container_snap_key("vm-1"), "vm-1-ctr-snap");
        assert_eq!(image_snap_key("vm-1"), "vm-1-img-snap");
    }
}
