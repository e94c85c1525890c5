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

//! Native gRPC client for the container runtime's CRI socket.

use core::time::Duration;
use std::path::{Path, PathBuf};

use hyper_util::rt::TokioIo;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::info;
use vgpu_config::CgroupDriver;
use vgpu_error::{make_err, Code, Error, ResultExt};
use vgpu_proto::runtime::v1::runtime_service_client::RuntimeServiceClient;
use vgpu_proto::runtime::v1::{ContainerStatus, ContainerStatusRequest, VersionRequest};

use crate::cgroup::{ContainerCgroup, QosClass, RuntimeFlavor, CGROUP_MEMORY_ROOT};

/// Connects a tonic channel to a unix socket. The http authority is a
/// placeholder; the connector ignores it and dials the socket instead.
pub async fn connect_unix_channel(socket_path: impl AsRef<Path>) -> Result<Channel, Error> {
    let socket_path = socket_path.as_ref().to_path_buf();
    Endpoint::try_from("http://[::]:50051")
        .map_err(|e| make_err!(Code::Internal, "failed to create endpoint: {e}"))?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = socket_path.clone();
            async move {
                tokio::net::UnixStream::connect(path)
                    .await
                    .map(TokioIo::new)
                    .map_err(std::io::Error::other)
            }
        }))
        .await
        .map_err(|e| make_err!(Code::Unavailable, "failed to connect unix socket: {e}"))
}

/// Operations the daemon needs from the container runtime.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn runtime_name(&self) -> &str;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerStatus, Error>;

    /// Pids currently inside the container, resolved through its memory
    /// cgroup.
    async fn pids_in_container(
        &self,
        pod_uid: &str,
        qos: QosClass,
        container_id: &str,
    ) -> Result<Vec<i32>, Error>;
}

#[derive(Debug, Clone)]
pub struct CriRuntime {
    runtime_name: String,
    flavor: RuntimeFlavor,
    cgroup_driver: CgroupDriver,
    cgroup_root: PathBuf,
    request_timeout: Duration,
    client: RuntimeServiceClient<Channel>,
}

impl CriRuntime {
    /// Dials the CRI socket and asks the runtime to identify itself.
    pub async fn connect(
        endpoint: impl AsRef<Path>,
        cgroup_driver: CgroupDriver,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let channel = connect_unix_channel(&endpoint)
            .await
            .err_tip(|| format!("while dialing CRI endpoint {}", endpoint.as_ref().display()))?;
        let mut client = RuntimeServiceClient::new(channel);

        let response = tokio::time::timeout(
            request_timeout,
            client.version(VersionRequest {
                version: "v1".to_string(),
            }),
        )
        .await
        .map_err(Error::from)?
        .err_tip(|| "while querying CRI version")?
        .into_inner();

        info!(
            runtime = response.runtime_name,
            version = response.runtime_version,
            "container runtime detected"
        );
        let flavor = RuntimeFlavor::from_runtime_name(&response.runtime_name)?;

        Ok(Self {
            runtime_name: response.runtime_name,
            flavor,
            cgroup_driver,
            cgroup_root: PathBuf::from(CGROUP_MEMORY_ROOT),
            request_timeout,
            client,
        })
    }

    /// Overrides the memory-cgroup mount point; used by tests.
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for CriRuntime {
    fn runtime_name(&self) -> &str {
        &self.runtime_name
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerStatus, Error> {
        let mut client = self.client.clone();
        let response = tokio::time::timeout(
            self.request_timeout,
            client.container_status(ContainerStatusRequest {
                container_id: container_id.to_string(),
                verbose: false,
            }),
        )
        .await
        .map_err(Error::from)?
        .err_tip(|| format!("while inspecting container {container_id}"))?;

        response
            .into_inner()
            .status
            .err_tip_with_code(|_| {
                (
                    Code::NotFound,
                    format!("no status returned for container {container_id}"),
                )
            })
    }

    async fn pids_in_container(
        &self,
        pod_uid: &str,
        qos: QosClass,
        container_id: &str,
    ) -> Result<Vec<i32>, Error> {
        let cgroup = ContainerCgroup {
            driver: self.cgroup_driver,
            flavor: self.flavor,
            pod_uid,
            qos,
            container_id,
        };
        let base = cgroup.resolve(&self.cgroup_root)?;
        crate::cgroup::pids_under(&base)
            .err_tip(|| format!("while collecting pids of container {container_id}"))
    }
}
