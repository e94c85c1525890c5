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

//! In-container registration client. Started by the runtime library
//! before the workload; identifies the calling container to the daemon
//! so the per-container quota files get written.

use core::time::Duration;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use vgpu_error::{make_err, Code, Error, ResultExt};
use vgpu_proto::vcuda::vcuda_service_client::VcudaServiceClient;
use vgpu_proto::vcuda::VDeviceRequest;
use vgpu_runtime::cgroup::{extract_ids_from_memory_line, memory_line};
use vgpu_runtime::connect_unix_channel;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Options {
    /// Path of the daemon's per-pod registration socket.
    #[clap(long)]
    addr: PathBuf,

    /// GPU card bus id of the caller.
    #[clap(long, default_value = "")]
    bus_id: String,

    /// Pod UID of the caller.
    #[clap(long, default_value = "")]
    pod_uid: String,

    /// Container name of the caller.
    #[clap(long, default_value = "")]
    cont_name: String,

    /// Container id of the caller.
    #[clap(long, default_value = "")]
    cont_id: String,

    /// Cgroup file to derive pod uid and container id from, usually
    /// /proc/self/cgroup.
    #[clap(long)]
    cgroup_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut options = Options::parse();
    if let Some(cgroup_path) = options.cgroup_path.clone() {
        let contents = std::fs::read_to_string(&cgroup_path)
            .map_err(Error::from)
            .err_tip(|| format!("while reading {}", cgroup_path.display()))?;
        if let Some(line) = memory_line(&contents) {
            let (pod_uid, container_id) = extract_ids_from_memory_line(line);
            let pod_uid = pod_uid
                .err_tip(|| format!("no pod uid in cgroup line {line:?}"))?;
            let container_id = container_id
                .err_tip(|| format!("no container id in cgroup line {line:?}"))?;
            if !options.cont_id.is_empty() && options.cont_id != container_id {
                return Err(make_err!(
                    Code::InvalidArgument,
                    "container id mismatch: argument {} cgroup {}",
                    options.cont_id,
                    container_id
                ));
            }
            options.pod_uid = pod_uid;
            options.cont_id = container_id;
        }
    }

    vgpu_error::error_if!(
        options.pod_uid.is_empty() || (options.cont_name.is_empty() && options.cont_id.is_empty()),
        "need a pod uid plus a container name or id, got {options:?}"
    );

    let channel = tokio::time::timeout(TIMEOUT, connect_unix_channel(&options.addr))
        .await
        .map_err(Error::from)?
        .err_tip(|| format!("while dialing {}", options.addr.display()))?;
    let mut client = VcudaServiceClient::new(channel);

    let mut request = VDeviceRequest {
        pod_uid: options.pod_uid,
        container_id: String::new(),
        container_name: options.cont_name.clone(),
        bus_id: options.bus_id,
    };
    // The id is the precise identifier; the name path is the fallback.
    if !options.cont_id.is_empty() {
        request.container_name = String::new();
        request.container_id = options.cont_id;
    }

    tokio::time::timeout(TIMEOUT, client.register_v_device(request))
        .await
        .map_err(Error::from)?
        .map_err(Error::from)
        .err_tip(|| "registration rejected by manager")?;
    info!("vdevice registered");
    Ok(())
}
