//! CRI façade: maps pod container-creation requests onto function microVMs.
//!
//! Only two container names get special treatment. A `user-container`
//! triggers a function VM boot running concurrently with the stock
//! runtime's placeholder create; a `queue-proxy` picks up the guest
//! address/port stashed by the former. Everything else passes through to
//! the stock runtime untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use firesnap_common::{Error, Result, DEFAULT_MEM_SIZE_MIB, DEFAULT_VCPU_COUNT};
use firesnap_executor::Orchestrator;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

pub const USER_CONTAINER_NAME: &str = "user-container";
pub const QUEUE_PROXY_NAME: &str = "queue-proxy";

pub const GUEST_IMAGE_ENV: &str = "GUEST_IMAGE";
pub const REVISION_ENV: &str = "K_REVISION";
pub const GUEST_PORT_ENV: &str = "GUEST_PORT";
pub const MEM_SIZE_ENV: &str = "MEM_SIZE_MB";
pub const VCPU_COUNT_ENV: &str = "VCPU_COUNT";
pub const GUEST_IP_ENV: &str = "GUEST_ADDR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    #[serde(default)]
    pub envs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub pod_sandbox_id: String,
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerResponse {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveContainerRequest {
    pub container_id: String,
}

/// Stock container runtime that handles every non-function container.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse>;

    async fn remove_container(&self, request: RemoveContainerRequest) -> Result<()>;
}

/// Guest address and port stashed between the user-container and
/// queue-proxy creation steps of one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub guest_ip: String,
    pub guest_port: String,
}

/// Recognized options from the user-container environment. Unknown keys
/// are ignored; malformed numeric values fail the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionOptions {
    pub image: String,
    pub revision: String,
    pub guest_port: String,
    pub mem_size_mib: u32,
    pub vcpu_count: u32,
}

impl FunctionOptions {
    pub fn from_envs(envs: &[KeyValue]) -> Result<Self> {
        Ok(Self {
            image: required(envs, GUEST_IMAGE_ENV)?,
            revision: required(envs, REVISION_ENV)?,
            guest_port: required(envs, GUEST_PORT_ENV)?,
            mem_size_mib: optional_u32(envs, MEM_SIZE_ENV, DEFAULT_MEM_SIZE_MIB)?,
            vcpu_count: optional_u32(envs, VCPU_COUNT_ENV, DEFAULT_VCPU_COUNT)?,
        })
    }
}

fn lookup<'a>(envs: &'a [KeyValue], key: &str) -> Option<&'a str> {
    envs.iter()
        .find(|kv| kv.key == key)
        .map(|kv| kv.value.as_str())
}

fn required(envs: &[KeyValue], key: &str) -> Result<String> {
    lookup(envs, key)
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("missing {key} in user container environment")))
}

fn optional_u32(envs: &[KeyValue], key: &str, default: u32) -> Result<u32> {
    match lookup(envs, key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| {
            Error::Config(format!(
                "invalid {key} value {value:?}: expected a 32-bit unsigned integer"
            ))
        }),
    }
}

pub struct CriService {
    stock: Arc<dyn RuntimeService>,
    orchestrator: Arc<Orchestrator>,
    vm_configs: Mutex<HashMap<String, VmConfig>>,
}

impl CriService {
    pub fn new(stock: Arc<dyn RuntimeService>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            stock,
            orchestrator,
            vm_configs: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, request), fields(pod = %request.pod_sandbox_id, container = %request.config.metadata.name))]
    pub async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        match request.config.metadata.name.as_str() {
            USER_CONTAINER_NAME => self.create_user_container(request).await,
            QUEUE_PROXY_NAME => self.create_queue_proxy(request).await,
            _ => self.stock.create_container(request).await,
        }
    }

    /// Remove the container and stop any VM bound to it. Stopping can be
    /// slow, so it runs detached and never blocks the response.
    #[instrument(skip(self, request), fields(container = %request.container_id))]
    pub async fn remove_container(&self, request: RemoveContainerRequest) -> Result<()> {
        let orchestrator = self.orchestrator.clone();
        let container_id = request.container_id.clone();
        tokio::spawn(async move {
            match orchestrator.stop_vm(&container_id).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {
                    debug!(container_id = %container_id, "no VM bound to removed container");
                }
                Err(e) => {
                    error!(container_id = %container_id, error = %e, "failed to stop microVM");
                }
            }
        });

        self.stock.remove_container(request).await
    }

    async fn create_user_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        let options = FunctionOptions::from_envs(&request.config.envs)?;

        // The stock runtime creates the placeholder while the VM boots; the
        // queue-proxy step depends on the placeholder existing, but VM boot
        // must not be serialized behind it.
        let stock = self.stock.clone();
        let stock_request = request.clone();
        let stock_create = tokio::spawn(async move { stock.create_container(stock_request).await });

        let vm_result = self
            .orchestrator
            .start_vm(
                &options.image,
                &options.revision,
                options.mem_size_mib,
                options.vcpu_count,
            )
            .await;

        let stock_result = stock_create.await.map_err(|e| {
            Error::external("stock-runtime", format!("create task failed: {e}"))
        })?;

        let instance = match vm_result {
            Ok(instance) => instance,
            Err(e) => {
                error!(error = %e, "failed to start VM");
                return Err(e);
            }
        };
        let response = match stock_result {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "stock runtime failed to create placeholder container");
                if let Err(se) = self.orchestrator.stop_vm(&instance.vm_id).await {
                    warn!(error = %se, "failed to stop VM after placeholder failure");
                }
                return Err(e);
            }
        };

        self.orchestrator
            .insert_active(&response.container_id, &instance)
            .await?;
        self.vm_configs.lock().await.insert(
            request.pod_sandbox_id.clone(),
            VmConfig {
                guest_ip: instance.guest_ip.clone(),
                guest_port: options.guest_port,
            },
        );

        Ok(response)
    }

    async fn create_queue_proxy(
        &self,
        mut request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        let vm_config = self
            .vm_configs
            .lock()
            .await
            .remove(&request.pod_sandbox_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no VM config for pod {}",
                    request.pod_sandbox_id
                ))
            })?;

        request.config.envs.push(KeyValue {
            key: GUEST_IP_ENV.to_string(),
            value: vm_config.guest_ip,
        });
        request.config.envs.push(KeyValue {
            key: GUEST_PORT_ENV.to_string(),
            value: vm_config.guest_port,
        });

        self.stock.create_container(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> Vec<KeyValue> {
        pairs
            .iter()
            .map(|(key, value)| KeyValue {
                key: key.to_string(),
                value: value.to_string(),
            })
            .collect()
    }

    #[test]
    fn options_parse_with_defaults() {
        let options = FunctionOptions::from_envs(&envs(&[
            ("GUEST_IMAGE", "docker.io/x/hello:1"),
            ("K_REVISION", "hello-1"),
            ("GUEST_PORT", "8080"),
            ("SOME_PLATFORM_VAR", "ignored"),
        ]))
        .unwrap();

        assert_eq!(options.image, "docker.io/x/hello:1");
        assert_eq!(options.revision, "hello-1");
        assert_eq!(options.guest_port, "8080");
        assert_eq!(options.mem_size_mib, 256);
        assert_eq!(options.vcpu_count, 1);
    }

    #[test]
    fn options_parse_explicit_sizes() {
        let options = FunctionOptions::from_envs(&envs(&[
            ("GUEST_IMAGE", "hello"),
            ("K_REVISION", "hello-1"),
            ("GUEST_PORT", "8080"),
            ("MEM_SIZE_MB", "512"),
            ("VCPU_COUNT", "2"),
        ]))
        .unwrap();
        assert_eq!(options.mem_size_mib, 512);
        assert_eq!(options.vcpu_count, 2);
    }

    #[test]
    fn missing_required_option_fails() {
        let err = FunctionOptions::from_envs(&envs(&[
            ("K_REVISION", "hello-1"),
            ("GUEST_PORT", "8080"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("GUEST_IMAGE"));
    }

    #[test]
    fn malformed_numeric_option_fails() {
        let err = FunctionOptions::from_envs(&envs(&[
            ("GUEST_IMAGE", "hello"),
            ("K_REVISION", "hello-1"),
            ("GUEST_PORT", "8080"),
            ("MEM_SIZE_MB", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("MEM_SIZE_MB"));
    }
}
