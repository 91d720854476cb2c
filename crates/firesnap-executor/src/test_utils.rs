//! In-memory doubles of the external services for tests.
//!
//! The mocks record every call in order and can be told to fail a single
//! operation, which is enough to script the failure scenarios the
//! orchestrator has to clean up after.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use firesnap_common::{Error, Result};
use tokio::sync::Mutex;

use crate::hypervisor::{CreateSnapshotRequest, CreateVmRequest, Hypervisor};
use crate::patch::Patcher;
use crate::runtime::{ContainerHandle, ContainerRuntime, ImageHandle, Lease, Mount, TaskHandle};

/// Container runtime double. Snapshot "devices" are directories under
/// `device_dir`, so the patching layer can be exercised without a thin pool.
pub struct MockRuntime {
    device_dir: PathBuf,
    pub calls: Mutex<Vec<String>>,
    pub pulls: Mutex<Vec<String>>,
    pub snapshots: Mutex<HashMap<String, PathBuf>>,
    pub leases: Mutex<HashSet<String>>,
    fail_on: Mutex<Option<&'static str>>,
}

impl MockRuntime {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
            calls: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            snapshots: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashSet::new()),
            fail_on: Mutex::new(None),
        }
    }

    /// Make the named operation fail until cleared.
    pub async fn fail_on(&self, operation: &'static str) {
        *self.fail_on.lock().await = Some(operation);
    }

    pub async fn clear_failure(&self) {
        *self.fail_on.lock().await = None;
    }

    async fn step(&self, operation: &'static str, detail: &str) -> Result<()> {
        self.calls.lock().await.push(if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{operation} {detail}")
        });
        if *self.fail_on.lock().await == Some(operation) {
            return Err(Error::external(
                "container-runtime",
                format!("injected {operation} failure"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image_url: &str) -> Result<ImageHandle> {
        self.step("pull_image", image_url).await?;
        self.pulls.lock().await.push(image_url.to_string());
        Ok(ImageHandle {
            reference: image_url.to_string(),
        })
    }

    async fn create_lease(&self, id: &str) -> Result<Lease> {
        self.step("create_lease", id).await?;
        self.leases.lock().await.insert(id.to_string());
        Ok(Lease { id: id.to_string() })
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<()> {
        self.step("delete_lease", &lease.id).await?;
        self.leases.lock().await.remove(&lease.id);
        Ok(())
    }

    async fn prepare_snapshot(
        &self,
        key: &str,
        _image: &ImageHandle,
        _lease: &Lease,
    ) -> Result<Vec<Mount>> {
        self.step("prepare_snapshot", key).await?;
        let device = self.device_dir.join(key);
        std::fs::create_dir_all(&device)
            .map_err(|e| Error::io("creating mock device", &device, e))?;
        self.snapshots
            .lock()
            .await
            .insert(key.to_string(), device.clone());
        Ok(vec![Mount {
            kind: "ext4".to_string(),
            source: device,
            options: vec![],
        }])
    }

    async fn snapshot_mounts(&self, key: &str) -> Result<Vec<Mount>> {
        self.step("snapshot_mounts", key).await?;
        let snapshots = self.snapshots.lock().await;
        let device = snapshots
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("no snapshot {key}")))?;
        Ok(vec![Mount {
            kind: "ext4".to_string(),
            source: device.clone(),
            options: vec![],
        }])
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        self.step("remove_snapshot", key).await?;
        if let Some(device) = self.snapshots.lock().await.remove(key) {
            let _ = std::fs::remove_dir_all(device);
        }
        Ok(())
    }

    async fn create_container(
        &self,
        vm_id: &str,
        snap_key: &str,
        _image: &ImageHandle,
    ) -> Result<ContainerHandle> {
        self.step("create_container", snap_key).await?;
        Ok(ContainerHandle {
            id: format!("{vm_id}-ctr"),
        })
    }

    async fn create_task(&self, container: &ContainerHandle) -> Result<TaskHandle> {
        self.step("create_task", &container.id).await?;
        Ok(TaskHandle {
            container_id: container.id.clone(),
        })
    }

    async fn start_task(&self, task: &TaskHandle) -> Result<()> {
        self.step("start_task", &task.container_id).await
    }

    async fn kill_task(&self, task: &TaskHandle) -> Result<()> {
        self.step("kill_task", &task.container_id).await
    }

    async fn wait_task(&self, task: &TaskHandle) -> Result<u32> {
        self.step("wait_task", &task.container_id).await?;
        Ok(0)
    }

    async fn delete_task(&self, task: &TaskHandle) -> Result<()> {
        self.step("delete_task", &task.container_id).await
    }

    async fn delete_container(
        &self,
        container: &ContainerHandle,
        cleanup_snapshot: bool,
    ) -> Result<()> {
        self.step("delete_container", &container.id).await?;
        if cleanup_snapshot {
            // The runtime removes the container's snapshot along with it.
            let vm_id = container.id.trim_end_matches("-ctr");
            let key = format!("{vm_id}-ctr-snap");
            if let Some(device) = self.snapshots.lock().await.remove(&key) {
                let _ = std::fs::remove_dir_all(device);
            }
        }
        Ok(())
    }
}

/// Hypervisor double recording requests; `create_snapshot` writes dummy
/// artifact files so captures look real to the registry.
#[derive(Default)]
pub struct MockHypervisor {
    pub create_requests: Mutex<Vec<CreateVmRequest>>,
    pub snapshot_requests: Mutex<Vec<CreateSnapshotRequest>>,
    pub events: Mutex<Vec<String>>,
    fail_on: Mutex<Option<&'static str>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_on(&self, operation: &'static str) {
        *self.fail_on.lock().await = Some(operation);
    }

    pub async fn clear_failure(&self) {
        *self.fail_on.lock().await = None;
    }

    async fn step(&self, operation: &'static str, vm_id: &str) -> Result<()> {
        self.events
            .lock()
            .await
            .push(format!("{operation} {vm_id}"));
        if *self.fail_on.lock().await == Some(operation) {
            return Err(Error::external(
                "hypervisor",
                format!("injected {operation} failure"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<()> {
        self.step("create_vm", &request.vm_id).await?;
        self.create_requests.lock().await.push(request.clone());
        Ok(())
    }

    async fn pause_vm(&self, vm_id: &str) -> Result<()> {
        self.step("pause_vm", vm_id).await
    }

    async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        self.step("resume_vm", vm_id).await
    }

    async fn create_snapshot(&self, request: &CreateSnapshotRequest) -> Result<()> {
        self.step("create_snapshot", &request.vm_id).await?;
        std::fs::write(&request.mem_file_path, b"mock guest memory")
            .map_err(|e| Error::io("writing", &request.mem_file_path, e))?;
        std::fs::write(&request.snapshot_path, b"mock machine state")
            .map_err(|e| Error::io("writing", &request.snapshot_path, e))?;
        self.snapshot_requests.lock().await.push(request.clone());
        Ok(())
    }

    async fn stop_vm(&self, vm_id: &str) -> Result<()> {
        self.step("stop_vm", vm_id).await
    }
}

/// Patcher double that records calls and writes a marker batch file.
#[derive(Default)]
pub struct MockPatcher {
    pub extracts: Mutex<Vec<(PathBuf, PathBuf, PathBuf)>>,
    pub applies: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl MockPatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Patcher for MockPatcher {
    async fn extract(
        &self,
        image_dev: &std::path::Path,
        container_dev: &std::path::Path,
        patch_path: &std::path::Path,
    ) -> Result<()> {
        std::fs::write(patch_path, b"mock batch delta")
            .map_err(|e| Error::io("writing", patch_path, e))?;
        self.extracts.lock().await.push((
            image_dev.to_path_buf(),
            container_dev.to_path_buf(),
            patch_path.to_path_buf(),
        ));
        Ok(())
    }

    async fn apply(&self, container_dev: &std::path::Path, patch_path: &std::path::Path) -> Result<()> {
        if !patch_path.is_file() {
            return Err(Error::NotFound(format!(
                "patch {} does not exist",
                patch_path.display()
            )));
        }
        self.applies
            .lock()
            .await
            .push((container_dev.to_path_buf(), patch_path.to_path_buf()));
        Ok(())
    }
}
