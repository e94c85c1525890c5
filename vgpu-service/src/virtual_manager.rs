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

//! Per-pod lifecycle: a host directory and a unix gRPC server for every
//! pod holding a reservation. The in-container client registers through
//! that server, at which point the container's resource files are
//! written and the two-phase allocation completes.

use core::time::Duration;
use std::collections::HashMap;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};
use vgpu_config::well_known::{
    HUNDRED_CORE, MEMORY_BLOCK_SIZE, VCORE_LIMIT_ANNOTATION, VCORE_RESOURCE, VDEVICE_SOCKET,
    VMEMORY_RESOURCE,
};
use vgpu_config::Config;
use vgpu_error::{make_err, Code, Error, ResultExt};
use vgpu_proto::vcuda::vcuda_service_server::{VcudaService, VcudaServiceServer};
use vgpu_proto::vcuda::{VDeviceRequest, VDeviceResponse};
use vgpu_runtime::ContainerRuntime;
use k8s_openapi::api::core::v1::Pod;

use crate::allocator::VDeviceEvent;
use crate::response::ResponseCache;
use crate::vdevice_config::{write_pids_config, VDeviceConfig};
use crate::watchdog::{container_resource_limit, qos_class, PodSource};

const PIDS_CONFIG_NAME: &str = "pids.config";
const CONTROLLER_CONFIG_NAME: &str = "vcuda.config";
const DIR_MODE: u32 = 0o777;
/// How long `RegisterVDevice` waits for the pod or container to appear.
const LOCATE_TIMEOUT: Duration = Duration::from_secs(60);
const LOCATE_INTERVAL: Duration = Duration::from_secs(1);
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
}

pub struct VirtualManager {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<ResponseCache>,
    pods: Arc<dyn PodSource>,
    driver_version: (u32, u32),
    servers: Mutex<HashMap<PathBuf, ServerHandle>>,
}

impl VirtualManager {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<ResponseCache>,
        pods: Arc<dyn PodSource>,
        driver_version: (u32, u32),
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            runtime,
            cache,
            pods,
            driver_version,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Recovers servers for live reservations, then runs the dispatcher
    /// and the periodic sweeps until the event channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<VDeviceEvent>) -> Result<(), Error> {
        std::fs::create_dir_all(&self.config.virtual_manager_path)
            .map_err(Error::from)
            .err_tip(|| {
                format!(
                    "while creating {}",
                    self.config.virtual_manager_path.display()
                )
            })?;
        self.recover().await?;

        let gc = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                gc.collect_garbage().await;
                gc.close_orphaned_servers().await;
            }
        });

        info!("virtual manager is running");
        while let Some(event) = events.recv().await {
            debug!(pod_uid = event.pod_uid, "setting up pod directory");
            let result = self.setup_pod(&event.pod_uid).await;
            // The allocator gave up waiting if this send fails.
            let _ = event.done.send(result);
        }
        Ok(())
    }

    /// Re-spawns a server for every still-active pod found in the cache
    /// rebuilt from the checkpoint.
    async fn recover(self: &Arc<Self>) -> Result<(), Error> {
        let active = self.pods.active_pods();
        for (pod_uid, containers) in self.cache.list_all()? {
            if !active.contains_key(&pod_uid) {
                continue;
            }
            for (container_name, allocation) in containers {
                let Some(dir) = allocation.vcuda_mount_path() else {
                    error!(pod_uid, container_name, "reservation has no vcuda mount");
                    continue;
                };
                let dir = PathBuf::from(dir);
                if !dir.exists() {
                    debug!(dir = %dir.display(), "skipping vanished pod directory");
                    continue;
                }
                self.start_server(dir.clone())
                    .await
                    .err_tip(|| format!("while recovering server for {}", dir.display()))?;
                info!(dir = %dir.display(), "recovered vdevice server");
            }
        }
        Ok(())
    }

    async fn setup_pod(self: &Arc<Self>, pod_uid: &str) -> Result<(), Error> {
        let dir = self.config.virtual_manager_path.join(pod_uid);
        std::fs::create_dir_all(&dir)
            .map_err(Error::from)
            .err_tip(|| format!("while creating {}", dir.display()))?;
        std::fs::set_permissions(&dir, Permissions::from_mode(DIR_MODE))
            .map_err(Error::from)
            .err_tip(|| format!("while chmodding {}", dir.display()))?;
        self.start_server(dir).await
    }

    /// Binds `<dir>/vcuda.sock` and serves the registration endpoint on
    /// it. Replacing an existing handle shuts the previous server down.
    async fn start_server(self: &Arc<Self>, dir: PathBuf) -> Result<(), Error> {
        let socket = dir.join(VDEVICE_SOCKET);
        match std::fs::remove_file(&socket) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::from(err))
                    .err_tip(|| format!("while removing stale socket {}", socket.display()))
            }
        }

        let listener = UnixListener::bind(&socket)
            .map_err(Error::from)
            .err_tip(|| format!("while binding {}", socket.display()))?;
        std::fs::set_permissions(&socket, Permissions::from_mode(DIR_MODE))
            .map_err(Error::from)
            .err_tip(|| format!("while chmodding {}", socket.display()))?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let service = VDeviceService {
            manager: Arc::clone(self),
        };
        let socket_for_log = socket.clone();
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(VcudaServiceServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                error!(?err, socket = %socket_for_log.display(), "vdevice server died");
            }
        });

        self.servers.lock().await.insert(dir, ServerHandle { shutdown });
        Ok(())
    }

    /// Removes directories and servers of pods that left the cluster.
    pub async fn collect_garbage(self: &Arc<Self>) {
        let active = self.pods.active_pods();
        let listing = match self.cache.list_all() {
            Ok(listing) => listing,
            Err(err) => {
                warn!(?err, "can't list reservations for gc");
                return;
            }
        };

        for (pod_uid, containers) in listing {
            if active.contains_key(&pod_uid) {
                continue;
            }
            for (container_name, allocation) in containers {
                let Some(dir) = allocation.vcuda_mount_path() else {
                    continue;
                };
                warn!(pod_uid, container_name, "found orphaned pod directory");
                let dir = PathBuf::from(dir);
                if let Some(handle) = self.servers.lock().await.remove(&dir) {
                    let _ = handle.shutdown.send(());
                }
                if let Err(err) = std::fs::remove_dir_all(&dir) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(?err, dir = %dir.display(), "can't remove pod directory");
                    }
                }
            }
        }
    }

    /// Stops servers whose directory was removed behind our back.
    async fn close_orphaned_servers(self: &Arc<Self>) {
        let mut servers = self.servers.lock().await;
        let orphaned: Vec<PathBuf> = servers
            .keys()
            .filter(|dir| !dir.exists())
            .cloned()
            .collect();
        for dir in orphaned {
            info!(dir = %dir.display(), "closing orphaned server");
            if let Some(handle) = servers.remove(&dir) {
                let _ = handle.shutdown.send(());
            }
        }
    }

    /// Completes the second phase for a container identified by its
    /// runtime id.
    pub async fn register_with_container_id(
        &self,
        pod_uid: &str,
        container_id: &str,
        bus_id: &str,
    ) -> Result<(), Error> {
        info!(pod_uid, container_id, "vdevice registration by id");
        let status = self
            .runtime
            .inspect_container(container_id)
            .await
            .err_tip(|| {
                format!(
                    "can't find {container_id} in {}",
                    self.runtime.runtime_name()
                )
            })?;
        let container_name = status
            .metadata
            .as_ref()
            .map(|metadata| metadata.name.clone())
            .err_tip(|| format!("container {container_id} has no metadata"))?;

        self.write_container_files(pod_uid, &container_name, container_id, container_id, bus_id)
            .await
    }

    /// Fallback for clients that only know the container's name; the
    /// runtime id is discovered through the pod's status.
    pub async fn register_with_container_name(
        &self,
        pod_uid: &str,
        container_name: &str,
        bus_id: &str,
    ) -> Result<(), Error> {
        info!(pod_uid, container_name, "vdevice registration by name");
        let mut waited = Duration::ZERO;
        let container_id = loop {
            let pod = self.locate_pod(pod_uid).await?;
            let found = pod
                .status
                .as_ref()
                .and_then(|status| status.container_statuses.as_ref())
                .and_then(|statuses| {
                    statuses
                        .iter()
                        .find(|status| status.name.starts_with(container_name))
                })
                .and_then(|status| status.container_id.clone())
                .map(|id| strip_runtime_prefix(&id).to_string());
            match found {
                Some(id) if !id.is_empty() => break id,
                _ => {
                    if waited >= LOCATE_TIMEOUT {
                        return Err(make_err!(
                            Code::NotFound,
                            "can't locate {pod_uid}({container_name})"
                        ));
                    }
                    tokio::time::sleep(LOCATE_INTERVAL).await;
                    waited += LOCATE_INTERVAL;
                }
            }
        };

        self.write_container_files(pod_uid, container_name, &container_id, container_name, bus_id)
            .await
    }

    /// Writes `pids.config` and `vcuda.config` under the pod directory,
    /// in a subdirectory named by the identifier the client supplied.
    async fn write_container_files(
        &self,
        pod_uid: &str,
        container_name: &str,
        container_id: &str,
        subdir: &str,
        bus_id: &str,
    ) -> Result<(), Error> {
        let allocation = self
            .cache
            .get(pod_uid, container_name)?
            .err_tip_with_code(|_| {
                (
                    Code::NotFound,
                    format!("unable to load allocation for {pod_uid}/{container_name}"),
                )
            })?;
        let base = allocation
            .vcuda_mount_path()
            .err_tip(|| "allocation has no vcuda mount")?;
        let dir = Path::new(base).join(subdir);
        std::fs::create_dir_all(&dir)
            .map_err(Error::from)
            .err_tip(|| format!("while creating {}", dir.display()))?;

        let pod = self.locate_pod(pod_uid).await?;

        let pids = self
            .runtime
            .pids_in_container(pod_uid, qos_class(&pod), container_id)
            .await
            .err_tip(|| format!("while listing pids of {container_id}"))?;
        debug!(?pids, container_id, "container pids");
        let pids_path = dir.join(PIDS_CONFIG_NAME);
        write_pids_config(&pids_path, &pids)
            .err_tip(|| format!("while writing {}", pids_path.display()))?;

        let config_path = dir.join(CONTROLLER_CONFIG_NAME);
        if config_path.exists() {
            return Ok(());
        }
        let config = self.build_vdevice_config(&pod, pod_uid, container_name, bus_id)?;
        config
            .write_to(&config_path)
            .err_tip(|| format!("while writing {}", config_path.display()))?;
        Ok(())
    }

    fn build_vdevice_config(
        &self,
        pod: &Pod,
        pod_uid: &str,
        container_name: &str,
        bus_id: &str,
    ) -> Result<VDeviceConfig, Error> {
        let annotations = pod.metadata.annotations.as_ref();
        let mut hard_limit = true;
        let mut limit = 0u32;
        if let Some(raw) = annotations.and_then(|map| map.get(VCORE_LIMIT_ANNOTATION)) {
            hard_limit = false;
            limit = raw
                .parse::<u32>()
                .map_err(Error::from)
                .err_tip(|| format!("bad {VCORE_LIMIT_ANNOTATION} annotation {raw:?}"))?
                .min(HUNDRED_CORE as u32);
        }

        let container = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
            .iter()
            .find(|container| {
                container.name == container_name
                    || container_name.starts_with(&format!("/k8s_{}_", container.name))
            })
            .err_tip_with_code(|_| {
                (
                    Code::NotFound,
                    format!("can't locate {pod_uid}({container_name})"),
                )
            })?;

        let cores = container_resource_limit(container, VCORE_RESOURCE);
        let memory = container_resource_limit(container, VMEMORY_RESOURCE) * MEMORY_BLOCK_SIZE as i64;

        Ok(VDeviceConfig {
            pod_uid: pod_uid.to_string(),
            container_name: container_name.to_string(),
            bus_id: bus_id.to_string(),
            gpu_memory: memory as u64,
            utilization: cores.clamp(0, HUNDRED_CORE) as u32,
            hard_limit,
            limit,
            driver_version: self.driver_version,
            // A container holding a whole card runs unmanaged.
            enable: cores < HUNDRED_CORE,
        })
    }

    /// Waits up to a minute for the pod to appear in the informer view.
    async fn locate_pod(&self, pod_uid: &str) -> Result<Arc<Pod>, Error> {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(pod) = self.pods.active_pods().remove(pod_uid) {
                return Ok(pod);
            }
            if waited >= LOCATE_TIMEOUT {
                return Err(make_err!(Code::NotFound, "can't locate pod {pod_uid}"));
            }
            tokio::time::sleep(LOCATE_INTERVAL).await;
            waited += LOCATE_INTERVAL;
        }
    }
}

fn strip_runtime_prefix(container_id: &str) -> &str {
    container_id
        .split_once("://")
        .map(|(_, id)| id)
        .unwrap_or(container_id)
}

/// The tonic service bound inside each pod directory.
pub struct VDeviceService {
    manager: Arc<VirtualManager>,
}

#[tonic::async_trait]
impl VcudaService for VDeviceService {
    async fn register_v_device(
        &self,
        request: Request<VDeviceRequest>,
    ) -> Result<Response<VDeviceResponse>, Status> {
        let request = request.into_inner();
        let result = if !request.container_name.is_empty() {
            self.manager
                .register_with_container_name(
                    &request.pod_uid,
                    &request.container_name,
                    &request.bus_id,
                )
                .await
        } else {
            self.manager
                .register_with_container_id(
                    &request.pod_uid,
                    &request.container_id,
                    &request.bus_id,
                )
                .await
        };
        match result {
            Ok(()) => Ok(Response::new(VDeviceResponse {})),
            Err(err) => {
                error!(?err, "vdevice registration failed");
                Err(err.into())
            }
        }
    }
}
