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

use core::str::FromStr;
use core::time::Duration;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vgpu_error::{make_input_err, Code, Error, ResultExt, make_err};

pub mod well_known;

/// How the kubelet lays out cgroups on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    Cgroupfs,
    Systemd,
}

impl FromStr for CgroupDriver {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Error> {
        match value.to_ascii_lowercase().as_str() {
            "cgroupfs" => Ok(Self::Cgroupfs),
            "systemd" => Ok(Self::Systemd),
            other => Err(make_input_err!(
                "unknown cgroup driver {other}, only [ cgroupfs | systemd ] are supported"
            )),
        }
    }
}

/// Fully resolved daemon configuration. Built by the binary from flags,
/// then adjusted by the optional per-node overrides file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device driver this daemon manages. Only "nvidia" is wired up.
    pub driver: String,

    /// Identity of this host in the cluster, `NODE_NAME` by default.
    pub node_name: String,

    /// Root directory for per-pod state (`<path>/<pod-uid>/vcuda.sock`).
    pub virtual_manager_path: PathBuf,

    /// Directory the kubelet watches for device-plugin sockets.
    pub device_plugin_path: PathBuf,

    /// Directory holding the daemon's checkpoint file.
    pub checkpoint_path: PathBuf,

    /// Unix socket of the CRI runtime service.
    pub container_runtime_endpoint: PathBuf,

    pub cgroup_driver: CgroupDriver,

    /// Fraction of physical device memory advertised to the cluster,
    /// 0 < x <= 1. Oversubscription is not supported.
    pub device_memory_scaling: f64,

    /// Window for per-card process sampling.
    pub sample_period: Duration,

    /// Interval between reservation liveness sweeps.
    pub allocation_check_period: Duration,

    /// Deadline applied to every outbound RPC.
    pub request_timeout: Duration,

    /// How long the binary waits for internal services before giving up.
    pub wait_timeout: Duration,

    /// Whether fractional (share-mode) allocations are accepted.
    pub enable_share: bool,

    /// Extra labels patched onto the node alongside the GPU model label.
    pub node_labels: HashMap<String, String>,

    /// Host directory containing the in-container runtime library.
    pub driver_library_path: PathBuf,

    /// Textual topology matrix used when the device probe is unavailable.
    pub topology_file: Option<PathBuf>,

    /// Out-of-cluster kubeconfig; in-cluster config is used when absent.
    pub kubeconfig: Option<PathBuf>,
}

impl Config {
    /// Validates the pieces the daemon cannot run without. Mirrors the
    /// startup checks performed before any server is bound.
    pub fn validate(&self) -> Result<(), Error> {
        vgpu_error::error_if!(
            self.node_name.is_empty(),
            "node name is empty, set NODE_NAME or --hostname-override"
        );
        if !(self.device_memory_scaling > 0.0 && self.device_memory_scaling <= 1.0) {
            return Err(make_input_err!(
                "device memory scaling must be in (0, 1], got {}",
                self.device_memory_scaling
            ));
        }
        std::fs::metadata(&self.container_runtime_endpoint)
            .map_err(Error::from)
            .err_tip(|| {
                format!(
                    "container runtime endpoint {} is not reachable",
                    self.container_runtime_endpoint.display()
                )
            })?;
        Ok(())
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.checkpoint_path.join(well_known::CHECKPOINT_FILE_NAME)
    }

    /// Applies matching overrides from the per-node config file. A missing
    /// file is not an error; a malformed one is.
    pub fn apply_node_overrides(&mut self, path: &Path) -> Result<(), Error> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(Error::from(err))
                    .err_tip(|| format!("while reading node config {}", path.display()))
            }
        };
        let overrides: NodeConfigs = serde_json::from_slice(&raw)
            .map_err(Error::from)
            .err_tip(|| format!("while parsing node config {}", path.display()))?;
        for node in overrides.node_config {
            if node.name != self.node_name {
                continue;
            }
            if let Some(driver) = node.cgroup_driver {
                self.cgroup_driver = driver;
            }
            if let Some(endpoint) = node.container_runtime_endpoint {
                self.container_runtime_endpoint = endpoint;
            }
            if let Some(scaling) = node.device_memory_scaling {
                if scaling > 0.0 {
                    self.device_memory_scaling = scaling;
                }
            }
        }
        Ok(())
    }
}

/// Per-node override file (`config.json`). Lets one DaemonSet manifest
/// serve hosts with different runtimes or cgroup drivers.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfigs {
    #[serde(default, rename = "nodeConfig")]
    pub node_config: Vec<NodeConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Node name the overrides apply to.
    pub name: String,

    #[serde(default, rename = "cgroupDriver")]
    pub cgroup_driver: Option<CgroupDriver>,

    #[serde(default, rename = "containerRuntimeEndpoint")]
    pub container_runtime_endpoint: Option<PathBuf>,

    #[serde(default, rename = "deviceMemoryScaling")]
    pub device_memory_scaling: Option<f64>,
}

/// Parses `key=value,key2=value2` as passed to `--node-labels`.
pub fn parse_node_labels(raw: &str) -> Result<HashMap<String, String>, Error> {
    let mut labels = HashMap::new();
    for item in raw.split(',').filter(|item| !item.is_empty()) {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| make_err!(Code::InvalidArgument, "malformed node label {item}"))?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}
