//! Interface to the microVM hypervisor service.

use std::path::PathBuf;

use async_trait::async_trait;
use firesnap_common::{MachineConfig, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::uds::UdsClient;

const SERVICE: &str = "hypervisor";

/// Static network configuration handed to the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub mac_address: String,
    pub host_dev_name: String,
    /// Guest address with prefix length.
    pub primary_addr: String,
    pub gateway_addr: String,
    pub nameservers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub vm_id: String,
    pub machine_cfg: MachineConfig,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub netns_path: String,
    /// When set, boot by loading the snapshot triple below instead of a
    /// kernel cold boot.
    #[serde(default)]
    pub load_snapshot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub vm_id: String,
    pub mem_file_path: PathBuf,
    pub snapshot_path: PathBuf,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<()>;

    async fn pause_vm(&self, vm_id: &str) -> Result<()>;

    async fn resume_vm(&self, vm_id: &str) -> Result<()>;

    /// Write the paused VM's memory and machine state to the given paths.
    async fn create_snapshot(&self, request: &CreateSnapshotRequest) -> Result<()>;

    async fn stop_vm(&self, vm_id: &str) -> Result<()>;
}

/// JSON-over-Unix-socket client for the hypervisor service.
pub struct HypervisorClient {
    http: UdsClient,
}

impl HypervisorClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            http: UdsClient::new(socket_path, SERVICE),
        }
    }
}

#[async_trait]
impl Hypervisor for HypervisorClient {
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<()> {
        self.http.call("/vm/create", request).await
    }

    async fn pause_vm(&self, vm_id: &str) -> Result<()> {
        self.http.call("/vm/pause", &json!({ "vm_id": vm_id })).await
    }

    async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        self.http
            .call("/vm/resume", &json!({ "vm_id": vm_id }))
            .await
    }

    async fn create_snapshot(&self, request: &CreateSnapshotRequest) -> Result<()> {
        self.http.call("/vm/snapshot", request).await
    }

    async fn stop_vm(&self, vm_id: &str) -> Result<()> {
        self.http.call("/vm/stop", &json!({ "vm_id": vm_id })).await
    }
}
