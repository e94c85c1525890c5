// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use vgpu_config::well_known::{
    MEMORY_BLOCK_SIZE, VCORE_LIMIT_ANNOTATION, VCORE_RESOURCE, VCUDA_MOUNTPOINT, VDEVICE_SOCKET,
    VMEMORY_RESOURCE,
};
use vgpu_config::{CgroupDriver, Config};
use vgpu_error::{Code, Error, ResultExt};
use vgpu_proto::deviceplugin::v1beta1::{ContainerAllocateResponse, Mount};
use vgpu_proto::runtime::v1::{ContainerMetadata, ContainerStatus};
use vgpu_runtime::cgroup::QosClass;
use vgpu_runtime::ContainerRuntime;
use vgpu_service::allocator::VDeviceEvent;
use vgpu_service::response::{CachedAllocation, ResponseCache};
use vgpu_service::virtual_manager::VirtualManager;
use vgpu_service::watchdog::PodSource;

const POD_UID: &str = "11111111-2222-3333-4444-555555555555";
const CONTAINER_ID: &str = "8134e620c37afff34535d04db616284d8b14d659ef5a9fd3f5f6f12988bdfa21";

struct FakeRuntime {
    pids: Vec<i32>,
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    fn runtime_name(&self) -> &str {
        "containerd"
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerStatus, Error> {
        vgpu_error::error_if!(container_id != CONTAINER_ID, "unknown container");
        Ok(ContainerStatus {
            id: container_id.to_string(),
            metadata: Some(ContainerMetadata {
                name: "main".to_string(),
                attempt: 0,
            }),
            ..Default::default()
        })
    }

    async fn pids_in_container(
        &self,
        _pod_uid: &str,
        _qos: QosClass,
        _container_id: &str,
    ) -> Result<Vec<i32>, Error> {
        Ok(self.pids.clone())
    }
}

struct FakePods {
    pods: StdMutex<HashMap<String, Arc<Pod>>>,
}

impl FakePods {
    fn new(pods: Vec<Pod>) -> Arc<Self> {
        Arc::new(Self {
            pods: StdMutex::new(
                pods.into_iter()
                    .map(|pod| (pod.metadata.uid.clone().unwrap(), Arc::new(pod)))
                    .collect(),
            ),
        })
    }

    fn remove(&self, uid: &str) {
        self.pods.lock().unwrap().remove(uid);
    }
}

impl PodSource for FakePods {
    fn active_pods(&self) -> HashMap<String, Arc<Pod>> {
        self.pods.lock().unwrap().clone()
    }

    fn pod(&self, namespace: &str, name: &str) -> Result<Arc<Pod>, Error> {
        self.active_pods()
            .into_values()
            .find(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod.metadata.name.as_deref() == Some(name)
            })
            .err_tip(|| format!("no pod {namespace}/{name}"))
    }
}

fn gpu_pod(annotations: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            uid: Some(POD_UID.to_string()),
            name: Some("trainer".to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([
                        (VCORE_RESOURCE.to_string(), Quantity("30".to_string())),
                        (VMEMORY_RESOURCE.to_string(), Quantity("4000".to_string())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn config(vm_path: PathBuf, dir: &tempfile::TempDir) -> Arc<Config> {
    Arc::new(Config {
        driver: "nvidia".to_string(),
        node_name: "node-a".to_string(),
        virtual_manager_path: vm_path,
        device_plugin_path: dir.path().join("device-plugins"),
        checkpoint_path: dir.path().join("checkpoint"),
        container_runtime_endpoint: PathBuf::from("/var/run/containerd/containerd.sock"),
        cgroup_driver: CgroupDriver::Systemd,
        device_memory_scaling: 1.0,
        sample_period: Duration::from_secs(1),
        allocation_check_period: Duration::from_secs(30),
        request_timeout: Duration::from_secs(5),
        wait_timeout: Duration::from_secs(5),
        enable_share: true,
        node_labels: HashMap::new(),
        driver_library_path: dir.path().join("lib"),
        topology_file: None,
        kubeconfig: None,
    })
}

fn cached_allocation(pod_dir: &std::path::Path) -> CachedAllocation {
    CachedAllocation {
        devices: vec!["/dev/nvidia0".to_string()],
        core_ids: vec!["core-0".to_string()],
        cores: 30,
        memory: 4000 * MEMORY_BLOCK_SIZE as i64,
        response: ContainerAllocateResponse {
            mounts: vec![Mount {
                container_path: VCUDA_MOUNTPOINT.to_string(),
                host_path: pod_dir.to_string_lossy().into_owned(),
                read_only: false,
            }],
            ..Default::default()
        },
        created_at: SystemTime::now(),
    }
}

struct Fixture {
    manager: Arc<VirtualManager>,
    cache: Arc<ResponseCache>,
    pods: Arc<FakePods>,
    pod_dir: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture(pod: Pod, pids: Vec<i32>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let vm_path = dir.path().join("vm");
    let pod_dir = vm_path.join(POD_UID);
    std::fs::create_dir_all(&pod_dir).unwrap();

    let cache = Arc::new(ResponseCache::new());
    cache
        .insert(POD_UID, "main", cached_allocation(&pod_dir))
        .unwrap();
    let pods = FakePods::new(vec![pod]);
    let manager = VirtualManager::new(
        config(vm_path, &dir),
        Arc::new(FakeRuntime { pids }),
        cache.clone(),
        pods.clone(),
        (470, 57),
    );
    Fixture {
        manager,
        cache,
        pods,
        pod_dir,
        _dir: dir,
    }
}

fn read_i32(record: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(record[offset..offset + 4].try_into().unwrap())
}

#[tokio::test]
async fn registration_by_id_writes_both_config_files() {
    let fixture = fixture(gpu_pod(&[]), vec![101, 102]);
    fixture
        .manager
        .register_with_container_id(POD_UID, CONTAINER_ID, "0000:02:00.0")
        .await
        .unwrap();

    let container_dir = fixture.pod_dir.join(CONTAINER_ID);
    let pids = std::fs::read(container_dir.join("pids.config")).unwrap();
    assert_eq!(pids.len(), 8);
    assert_eq!(&pids[0..4], &101i32.to_le_bytes());

    let record = std::fs::read(container_dir.join("vcuda.config")).unwrap();
    assert_eq!(record.len(), 8240);
    // pod uid at offset 0, NUL-terminated.
    assert_eq!(&record[0..POD_UID.len()], POD_UID.as_bytes());
    assert_eq!(
        u64::from_le_bytes(record[8208..8216].try_into().unwrap()),
        4000 * MEMORY_BLOCK_SIZE
    );
    assert_eq!(read_i32(&record, 8216), 30); // utilization
    assert_eq!(read_i32(&record, 8220), 1); // hard limit
    assert_eq!(read_i32(&record, 8224), 470);
    assert_eq!(read_i32(&record, 8232), 1); // enable
}

#[tokio::test]
async fn core_limit_annotation_softens_the_quota() {
    let fixture = fixture(gpu_pod(&[(VCORE_LIMIT_ANNOTATION, "25")]), vec![7]);
    fixture
        .manager
        .register_with_container_id(POD_UID, CONTAINER_ID, "0000:02:00.0")
        .await
        .unwrap();

    let record = std::fs::read(fixture.pod_dir.join(CONTAINER_ID).join("vcuda.config")).unwrap();
    assert_eq!(read_i32(&record, 48), 25); // limit
    assert_eq!(read_i32(&record, 8220), 0); // hard limit off
}

#[tokio::test]
async fn registration_without_reservation_fails() {
    let fixture = fixture(gpu_pod(&[]), vec![7]);
    fixture.cache.delete(POD_UID, "main").unwrap();

    let err = fixture
        .manager
        .register_with_container_id(POD_UID, CONTAINER_ID, "0000:02:00.0")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn registration_with_empty_pid_list_fails() {
    let fixture = fixture(gpu_pod(&[]), Vec::new());
    let err = fixture
        .manager
        .register_with_container_id(POD_UID, CONTAINER_ID, "0000:02:00.0")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

#[tokio::test]
async fn dispatcher_creates_pod_directory_and_socket() {
    let fixture = fixture(gpu_pod(&[]), vec![7]);
    let (tx, rx) = mpsc::channel::<VDeviceEvent>(4);
    let manager = Arc::clone(&fixture.manager);
    tokio::spawn(async move {
        let _ = manager.run(rx).await;
    });

    let (done, done_rx) = tokio::sync::oneshot::channel();
    tx.send(VDeviceEvent {
        pod_uid: POD_UID.to_string(),
        done,
    })
    .await
    .unwrap();
    done_rx.await.unwrap().unwrap();

    assert!(fixture.pod_dir.join(VDEVICE_SOCKET).exists());
}

#[tokio::test]
async fn garbage_collector_removes_directories_of_dead_pods() {
    let fixture = fixture(gpu_pod(&[]), vec![7]);
    assert!(fixture.pod_dir.exists());

    // While the pod is active nothing is touched.
    fixture.manager.collect_garbage().await;
    assert!(fixture.pod_dir.exists());

    fixture.pods.remove(POD_UID);
    fixture.manager.collect_garbage().await;
    assert!(!fixture.pod_dir.exists());
}
