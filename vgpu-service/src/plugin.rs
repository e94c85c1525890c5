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

//! The kubelet-facing device-plugin endpoints. The daemon registers two
//! resources; the core endpoint answers `Allocate` for real, the memory
//! endpoint only advertises capacity.

use core::pin::Pin;
use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::unfold;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};
use tracing::{error, info};
use vgpu_config::well_known::{VCORE_RESOURCE, VCORE_SOCKET, VMEMORY_RESOURCE, VMEMORY_SOCKET};
use vgpu_config::Config;
use vgpu_error::{Error, ResultExt};
use vgpu_proto::deviceplugin::v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
use vgpu_proto::deviceplugin::v1beta1::registration_client::RegistrationClient;
use vgpu_proto::deviceplugin::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePluginOptions,
    Empty, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse, RegisterRequest, HEALTHY, UNHEALTHY,
    VERSION,
};
use vgpu_runtime::connect_unix_channel;
use vgpu_topology::probe::DeviceProbe;
use vgpu_topology::tree::GpuTree;

use crate::allocator::{core_device_ids, memory_device_ids, total_memory_blocks, Allocator};

/// How often the device list is re-examined for health changes.
const WATCH_PERIOD: Duration = Duration::from_secs(30);

/// Which of the two advertised resources an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Core,
    Memory,
}

impl ResourceKind {
    pub fn resource_name(self) -> &'static str {
        match self {
            Self::Core => VCORE_RESOURCE,
            Self::Memory => VMEMORY_RESOURCE,
        }
    }

    /// Endpoint socket file name under the kubelet plugin directory.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Core => VCORE_SOCKET,
            Self::Memory => VMEMORY_SOCKET,
        }
    }
}

struct PluginContext {
    kind: ResourceKind,
    config: Arc<Config>,
    tree: Arc<Mutex<GpuTree>>,
    probe: Arc<dyn DeviceProbe>,
}

impl PluginContext {
    /// The synthetic device list for this resource. Health is derived
    /// from probe reachability; a text-mode tree has nothing to probe
    /// and reports healthy.
    async fn device_list(&self) -> Vec<Device> {
        let tree = self.tree.lock().await;
        let healthy = !tree.real_mode()
            || self
                .probe
                .sample(0, self.config.sample_period)
                .is_ok();
        let health = if healthy { HEALTHY } else { UNHEALTHY };

        let ids = match self.kind {
            ResourceKind::Core => core_device_ids(tree.total()),
            ResourceKind::Memory => memory_device_ids(total_memory_blocks(
                &tree,
                self.config.device_memory_scaling,
            )),
        };
        ids.into_iter()
            .map(|id| Device {
                id,
                health: health.to_string(),
                topology: None,
            })
            .collect()
    }
}

pub struct DevicePluginService {
    context: Arc<PluginContext>,
    allocator: Arc<Allocator>,
}

impl DevicePluginService {
    pub fn new(
        kind: ResourceKind,
        config: Arc<Config>,
        tree: Arc<Mutex<GpuTree>>,
        probe: Arc<dyn DeviceProbe>,
        allocator: Arc<Allocator>,
    ) -> Self {
        Self {
            context: Arc::new(PluginContext {
                kind,
                config,
                tree,
                probe,
            }),
            allocator,
        }
    }

    pub fn into_service(self) -> DevicePluginServer<Self> {
        DevicePluginServer::new(self)
    }
}

type ListAndWatchStream =
    Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    type ListAndWatchStream = ListAndWatchStream;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        info!(
            resource = self.context.kind.resource_name(),
            "kubelet subscribed to device list"
        );
        let context = Arc::clone(&self.context);
        let ticker = tokio::time::interval(WATCH_PERIOD);

        let stream = unfold(
            (context, ticker, None::<Vec<Device>>),
            |(context, mut ticker, last)| async move {
                loop {
                    ticker.tick().await;
                    let devices = context.device_list().await;
                    if last.as_ref() != Some(&devices) {
                        let response = ListAndWatchResponse {
                            devices: devices.clone(),
                        };
                        return Some((Ok(response), (context, ticker, Some(devices))));
                    }
                }
            },
        );
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let requests = request.into_inner().container_requests;
        match self.context.kind {
            // The kubelet merges per-resource responses; everything the
            // container needs is attached to the core resource.
            ResourceKind::Memory => Ok(Response::new(AllocateResponse {
                container_responses: requests
                    .iter()
                    .map(|_| ContainerAllocateResponse::default())
                    .collect(),
            })),
            ResourceKind::Core => {
                let response = self.allocator.allocate(requests).await.map_err(|err| {
                    error!(?err, "allocate failed");
                    Status::from(err)
                })?;
                Ok(Response::new(response))
            }
        }
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

/// Binds the endpoint socket and serves the plugin until the process
/// exits. The stale socket of a previous incarnation is removed first.
pub async fn serve_plugin(
    service: DevicePluginService,
    socket_path: PathBuf,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(Error::from(err))
                .err_tip(|| format!("while removing stale socket {}", socket_path.display()))
        }
    }
    let listener = UnixListener::bind(&socket_path)
        .map_err(Error::from)
        .err_tip(|| format!("while binding {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "device plugin listening");

    let handle = tokio::spawn(async move {
        if let Err(err) = tonic::transport::Server::builder()
            .add_service(service.into_service())
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
        {
            error!(?err, socket = %socket_path.display(), "device plugin server died");
        }
    });
    Ok(handle)
}

/// Announces one resource to the kubelet's registration socket.
pub async fn register_with_kubelet(config: &Config, kind: ResourceKind) -> Result<(), Error> {
    let kubelet_socket: &Path = &config
        .device_plugin_path
        .join(vgpu_proto::deviceplugin::v1beta1::KUBELET_SOCKET);
    let channel = connect_unix_channel(kubelet_socket)
        .await
        .err_tip(|| format!("while dialing kubelet at {}", kubelet_socket.display()))?;
    let mut client = RegistrationClient::new(channel);

    client
        .register(RegisterRequest {
            version: VERSION.to_string(),
            endpoint: kind.endpoint().to_string(),
            resource_name: kind.resource_name().to_string(),
            options: Some(DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            }),
        })
        .await
        .map_err(Error::from)
        .err_tip(|| format!("while registering {}", kind.resource_name()))?;
    info!(resource = kind.resource_name(), "registered with kubelet");
    Ok(())
}
