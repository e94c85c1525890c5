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

//! Periodic node heartbeat plus the JSON device inventory other
//! controllers read to learn what this node offers.

use core::time::Duration;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vgpu_config::well_known::{
    DEVICE_REGISTER_ANNOTATION, HEARTBEAT_ANNOTATION, HUNDRED_CORE, MEMORY_BLOCK_SIZE,
};
use vgpu_config::Config;
use vgpu_error::Error;
use vgpu_topology::probe::DeviceProbe;
use vgpu_topology::tree::GpuTree;

const ANNOTATE_PERIOD: Duration = Duration::from_secs(30);

/// One device as advertised in the register annotation.
#[derive(Debug, Serialize)]
pub struct GpuInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty", rename = "type")]
    pub device_type: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub core: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub memory: i64,
    #[serde(rename = "isMig")]
    pub is_mig: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub capability: i64,
    pub health: bool,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

pub struct NodeAnnotator {
    client: kube::Client,
    config: Arc<Config>,
    tree: Arc<Mutex<GpuTree>>,
    probe: Arc<dyn DeviceProbe>,
}

impl NodeAnnotator {
    pub fn new(
        client: kube::Client,
        config: Arc<Config>,
        tree: Arc<Mutex<GpuTree>>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Self {
        Self {
            client,
            config,
            tree,
            probe,
        }
    }

    /// Patches heartbeat and inventory every 30 seconds, forever.
    pub async fn run(self) {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut ticker = tokio::time::interval(ANNOTATE_PERIOD);
        loop {
            ticker.tick().await;
            if let Err(err) = self.annotate_once(&nodes).await {
                warn!(?err, "node heartbeat patch failed");
            }
        }
    }

    async fn annotate_once(&self, nodes: &Api<Node>) -> Result<(), Error> {
        let inventory = self.inventory().await;
        let register = serde_json::to_string(&inventory).unwrap_or_else(|_| "[]".to_string());
        let heartbeat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0);

        let patch = json!({
            "metadata": {
                "annotations": {
                    HEARTBEAT_ANNOTATION: heartbeat.to_string(),
                    DEVICE_REGISTER_ANNOTATION: register,
                }
            }
        });
        nodes
            .patch(
                &self.config.node_name,
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await
            .map_err(|err| vgpu_error::make_err!(vgpu_error::Code::Unavailable, "{err}"))?;
        debug!("node heartbeat updated");
        Ok(())
    }

    async fn inventory(&self) -> Vec<GpuInfo> {
        let tree = self.tree.lock().await;
        tree.leaves()
            .iter()
            .map(|&leaf| {
                let node = tree.node(leaf);
                // Reachability of the probe decides advertised health.
                let health = !tree.real_mode()
                    || self
                        .probe
                        .sample(node.meta.id, self.config.sample_period)
                        .is_ok();
                let scaled =
                    (node.meta.total_memory as f64 * self.config.device_memory_scaling) as i64;
                let (major, minor) = node.meta.capability;
                GpuInfo {
                    id: node.meta.uuid.clone(),
                    device_type: node.meta.name.clone(),
                    core: HUNDRED_CORE,
                    memory: scaled / MEMORY_BLOCK_SIZE as i64,
                    is_mig: node.meta.mig_enabled,
                    capability: format!("{major}{minor}").parse().unwrap_or(0),
                    health,
                }
            })
            .collect()
    }
}
