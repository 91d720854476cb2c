//! Interface to the container runtime service.
//!
//! The runtime pulls images, prepares copy-on-write snapshots of them
//! through its thin snapshotter, and runs containers inside the function
//! VMs. It is an external process driven over an RPC socket; everything
//! here either describes that boundary or implements the client for it.

use std::path::PathBuf;

use async_trait::async_trait;
use firesnap_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::uds::UdsClient;

const SERVICE: &str = "container-runtime";

/// Opaque handle to a pulled image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHandle {
    pub reference: String,
}

/// Pins a runtime resource against the runtime's garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandle {
    pub container_id: String,
}

/// A mount of a prepared snapshot as reported by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub kind: String,
    pub source: PathBuf,
    #[serde(default)]
    pub options: Vec<String>,
}

/// The thin snapshotter exposes every snapshot as exactly one block device.
pub fn single_mount_source(key: &str, mounts: &[Mount]) -> Result<PathBuf> {
    match mounts {
        [mount] => Ok(mount.source.clone()),
        _ => Err(Error::external(
            SERVICE,
            format!(
                "snapshot {key} has {} mounts, expected exactly one",
                mounts.len()
            ),
        )),
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image_url: &str) -> Result<ImageHandle>;

    async fn create_lease(&self, id: &str) -> Result<Lease>;

    async fn delete_lease(&self, lease: &Lease) -> Result<()>;

    /// Prepare a copy-on-write snapshot of `image` under `key`, scoped to
    /// `lease` so the runtime's GC keeps it alive.
    async fn prepare_snapshot(
        &self,
        key: &str,
        image: &ImageHandle,
        lease: &Lease,
    ) -> Result<Vec<Mount>>;

    async fn snapshot_mounts(&self, key: &str) -> Result<Vec<Mount>>;

    async fn remove_snapshot(&self, key: &str) -> Result<()>;

    /// Create a container bound to `vm_id`'s VM and network, backed by the
    /// snapshot under `snap_key`.
    async fn create_container(
        &self,
        vm_id: &str,
        snap_key: &str,
        image: &ImageHandle,
    ) -> Result<ContainerHandle>;

    async fn create_task(&self, container: &ContainerHandle) -> Result<TaskHandle>;

    async fn start_task(&self, task: &TaskHandle) -> Result<()>;

    /// Kill the task with a fatal signal.
    async fn kill_task(&self, task: &TaskHandle) -> Result<()>;

    /// Block until the task exits, returning its exit status.
    async fn wait_task(&self, task: &TaskHandle) -> Result<u32>;

    async fn delete_task(&self, task: &TaskHandle) -> Result<()>;

    async fn delete_container(
        &self,
        container: &ContainerHandle,
        cleanup_snapshot: bool,
    ) -> Result<()>;
}

/// JSON-over-Unix-socket client for the container runtime service.
pub struct RuntimeClient {
    http: UdsClient,
}

impl RuntimeClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            http: UdsClient::new(socket_path, SERVICE),
        }
    }
}

#[derive(Deserialize)]
struct WaitResponse {
    exit_status: u32,
}

#[async_trait]
impl ContainerRuntime for RuntimeClient {
    async fn pull_image(&self, image_url: &str) -> Result<ImageHandle> {
        self.http
            .call("/images/pull", &json!({ "image": image_url }))
            .await
    }

    async fn create_lease(&self, id: &str) -> Result<Lease> {
        self.http.call("/leases/create", &json!({ "id": id })).await
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<()> {
        self.http
            .call("/leases/delete", &json!({ "id": lease.id }))
            .await
    }

    async fn prepare_snapshot(
        &self,
        key: &str,
        image: &ImageHandle,
        lease: &Lease,
    ) -> Result<Vec<Mount>> {
        self.http
            .call(
                "/snapshots/prepare",
                &json!({ "key": key, "image": image.reference, "lease": lease.id }),
            )
            .await
    }

    async fn snapshot_mounts(&self, key: &str) -> Result<Vec<Mount>> {
        self.http
            .call("/snapshots/mounts", &json!({ "key": key }))
            .await
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        self.http
            .call("/snapshots/remove", &json!({ "key": key }))
            .await
    }

    async fn create_container(
        &self,
        vm_id: &str,
        snap_key: &str,
        image: &ImageHandle,
    ) -> Result<ContainerHandle> {
        self.http
            .call(
                "/containers/create",
                &json!({
                    "vm_id": vm_id,
                    "snapshot_key": snap_key,
                    "image": image.reference,
                }),
            )
            .await
    }

    async fn create_task(&self, container: &ContainerHandle) -> Result<TaskHandle> {
        self.http
            .call("/tasks/create", &json!({ "container_id": container.id }))
            .await
    }

    async fn start_task(&self, task: &TaskHandle) -> Result<()> {
        self.http
            .call("/tasks/start", &json!({ "container_id": task.container_id }))
            .await
    }

    async fn kill_task(&self, task: &TaskHandle) -> Result<()> {
        self.http
            .call("/tasks/kill", &json!({ "container_id": task.container_id }))
            .await
    }

    async fn wait_task(&self, task: &TaskHandle) -> Result<u32> {
        let response: WaitResponse = self
            .http
            .call("/tasks/wait", &json!({ "container_id": task.container_id }))
            .await?;
        Ok(response.exit_status)
    }

    async fn delete_task(&self, task: &TaskHandle) -> Result<()> {
        self.http
            .call("/tasks/delete", &json!({ "container_id": task.container_id }))
            .await
    }

    async fn delete_container(
        &self,
        container: &ContainerHandle,
        cleanup_snapshot: bool,
    ) -> Result<()> {
        self.http
            .call(
                "/containers/delete",
                &json!({
                    "container_id": container.id,
                    "cleanup_snapshot": cleanup_snapshot,
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mount_rejects_unexpected_mount_counts() {
        let mount = Mount {
            kind: "ext4".to_string(),
            source: PathBuf::from("/dev/mapper/fc-thinpool-snap-4"),
            options: vec![],
        };

        let source = single_mount_source("key", &[mount.clone()]).unwrap();
        assert_eq!(source, PathBuf::from("/dev/mapper/fc-thinpool-snap-4"));

        assert!(single_mount_source("key", &[]).is_err());
        assert!(single_mount_source("key", &[mount.clone(), mount]).is_err());
    }
}
