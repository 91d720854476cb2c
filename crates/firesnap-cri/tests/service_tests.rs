//! CRI façade tests over a mocked stock runtime and mocked services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use firesnap_common::{Error, Result};
use firesnap_cri::{
    ContainerConfig, ContainerMetadata, CreateContainerRequest, CreateContainerResponse,
    CriService, KeyValue, RemoveContainerRequest, RuntimeService,
};
use firesnap_executor::network::NetworkManager;
use firesnap_executor::snapshots::SnapshotManager;
use firesnap_executor::test_utils::{MockHypervisor, MockPatcher, MockRuntime};
use firesnap_executor::Orchestrator;
use tokio::sync::Mutex;

/// Stock runtime double: hands out sequential container ids and records
/// every request it saw.
#[derive(Default)]
struct MockStock {
    requests: Mutex<Vec<CreateContainerRequest>>,
    removals: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
    fail_create: Mutex<bool>,
}

impl MockStock {
    async fn fail_next_create(&self) {
        *self.fail_create.lock().await = true;
    }
}

#[async_trait]
impl RuntimeService for MockStock {
    async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        self.requests.lock().await.push(request);
        if std::mem::take(&mut *self.fail_create.lock().await) {
            return Err(Error::external("stock-runtime", "injected create failure"));
        }
        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        Ok(CreateContainerResponse {
            container_id: format!("stock-{}", *next_id),
        })
    }

    async fn remove_container(&self, request: RemoveContainerRequest) -> Result<()> {
        self.removals.lock().await.push(request.container_id);
        Ok(())
    }
}

struct Harness {
    _scratch: tempfile::TempDir,
    stock: Arc<MockStock>,
    hypervisor: Arc<MockHypervisor>,
    orchestrator: Arc<Orchestrator>,
    service: CriService,
}

impl Harness {
    fn new() -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new(scratch.path().join("devices")));
        let hypervisor = Arc::new(MockHypervisor::new());
        let orchestrator = Arc::new(Orchestrator::new(
            runtime,
            hypervisor.clone(),
            NetworkManager::with_host_plumbing(false),
            SnapshotManager::new(scratch.path().join("snapshots"), 10 * 1024),
            Arc::new(MockPatcher::new()),
        ));
        let stock = Arc::new(MockStock::default());
        let service = CriService::new(stock.clone(), orchestrator.clone());
        Self {
            _scratch: scratch,
            stock,
            hypervisor,
            orchestrator,
            service,
        }
    }
}

fn request(pod: &str, name: &str, envs: &[(&str, &str)]) -> CreateContainerRequest {
    CreateContainerRequest {
        pod_sandbox_id: pod.to_string(),
        config: ContainerConfig {
            metadata: ContainerMetadata {
                name: name.to_string(),
            },
            envs: envs
                .iter()
                .map(|(key, value)| KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        },
    }
}

fn user_container_request(pod: &str) -> CreateContainerRequest {
    request(
        pod,
        "user-container",
        &[
            ("GUEST_IMAGE", "docker.io/x/hello:1"),
            ("K_REVISION", "hello-1"),
            ("GUEST_PORT", "8080"),
        ],
    )
}

#[tokio::test]
async fn user_container_boots_a_vm_and_queue_proxy_gets_its_address() {
    let h = Harness::new();

    let response = h
        .service
        .create_container(user_container_request("pod-1"))
        .await
        .unwrap();
    assert!(response.container_id.starts_with("stock-"));
    assert_eq!(h.orchestrator.list_vms().await.len(), 1);

    let proxy = h
        .service
        .create_container(request("pod-1", "queue-proxy", &[]))
        .await
        .unwrap();
    assert!(proxy.container_id.starts_with("stock-"));

    let requests = h.stock.requests.lock().await;
    let proxy_request = requests.last().unwrap();
    let addr = proxy_request
        .config
        .envs
        .iter()
        .find(|kv| kv.key == "GUEST_ADDR")
        .unwrap();
    assert!(addr.value.starts_with("172.16."));
    let port = proxy_request
        .config
        .envs
        .iter()
        .find(|kv| kv.key == "GUEST_PORT")
        .unwrap();
    assert_eq!(port.value, "8080");
}

#[tokio::test]
async fn queue_proxy_consumes_the_stashed_config() {
    let h = Harness::new();
    h.service
        .create_container(user_container_request("pod-1"))
        .await
        .unwrap();
    h.service
        .create_container(request("pod-1", "queue-proxy", &[]))
        .await
        .unwrap();

    // Second queue-proxy for the same pod has nothing to pick up.
    let err = h
        .service
        .create_container(request("pod-1", "queue-proxy", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn defaults_apply_when_sizes_are_omitted() {
    let h = Harness::new();
    h.service
        .create_container(user_container_request("pod-1"))
        .await
        .unwrap();

    let requests = h.hypervisor.create_requests.lock().await;
    let create = requests.last().unwrap();
    assert_eq!(create.machine_cfg.mem_size_mib, 256);
    assert_eq!(create.machine_cfg.vcpu_count, 1);
}

#[tokio::test]
async fn explicit_sizes_reach_the_hypervisor() {
    let h = Harness::new();
    h.service
        .create_container(request(
            "pod-1",
            "user-container",
            &[
                ("GUEST_IMAGE", "docker.io/x/hello:1"),
                ("K_REVISION", "hello-1"),
                ("GUEST_PORT", "8080"),
                ("MEM_SIZE_MB", "512"),
                ("VCPU_COUNT", "2"),
            ],
        ))
        .await
        .unwrap();

    let requests = h.hypervisor.create_requests.lock().await;
    let create = requests.last().unwrap();
    assert_eq!(create.machine_cfg.mem_size_mib, 512);
    assert_eq!(create.machine_cfg.vcpu_count, 2);
}

#[tokio::test]
async fn malformed_sizes_fail_before_anything_starts() {
    let h = Harness::new();
    let err = h
        .service
        .create_container(request(
            "pod-1",
            "user-container",
            &[
                ("GUEST_IMAGE", "docker.io/x/hello:1"),
                ("K_REVISION", "hello-1"),
                ("GUEST_PORT", "8080"),
                ("VCPU_COUNT", "two"),
            ],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(h.orchestrator.list_vms().await.is_empty());
    assert!(h.stock.requests.lock().await.is_empty());
}

#[tokio::test]
async fn other_containers_pass_through_untouched() {
    let h = Harness::new();
    h.service
        .create_container(request("pod-1", "istio-proxy", &[]))
        .await
        .unwrap();

    assert_eq!(h.stock.requests.lock().await.len(), 1);
    assert!(h.orchestrator.list_vms().await.is_empty());
}

#[tokio::test]
async fn placeholder_failure_stops_the_booted_vm() {
    let h = Harness::new();
    h.stock.fail_next_create().await;

    let err = h
        .service
        .create_container(user_container_request("pod-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::External { .. }));
    assert!(h.orchestrator.list_vms().await.is_empty());
}

#[tokio::test]
async fn remove_container_stops_the_vm_asynchronously() {
    let h = Harness::new();
    let response = h
        .service
        .create_container(user_container_request("pod-1"))
        .await
        .unwrap();

    h.service
        .remove_container(RemoveContainerRequest {
            container_id: response.container_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        h.stock.removals.lock().await.as_slice(),
        &[response.container_id]
    );

    // The stop runs detached; give it a moment to finish.
    for _ in 0..50 {
        if h.orchestrator.list_vms().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.orchestrator.list_vms().await.is_empty());
    assert!(h.orchestrator.network().list_allocations().await.is_empty());
}

#[tokio::test]
async fn remove_of_a_plain_container_only_forwards() {
    let h = Harness::new();
    h.service
        .remove_container(RemoveContainerRequest {
            container_id: "not-a-vm".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(h.stock.removals.lock().await.as_slice(), &["not-a-vm"]);
}
