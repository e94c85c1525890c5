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

//! One-shot node labeling with the detected device model.

use core::time::Duration;
use std::collections::{BTreeSet, HashMap};

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use vgpu_config::well_known::GPU_MODEL_LABEL;
use vgpu_error::{make_err, Code, Error};
use vgpu_topology::tree::GpuTree;

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_TIMEOUT: Duration = Duration::from_secs(60);

pub struct NodeLabeler {
    client: kube::Client,
    node_name: String,
    extra_labels: HashMap<String, String>,
}

impl NodeLabeler {
    pub fn new(
        client: kube::Client,
        node_name: impl Into<String>,
        extra_labels: HashMap<String, String>,
    ) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            extra_labels,
        }
    }

    /// Patches the gpu-model label (plus any configured static labels)
    /// onto the node, retrying conflicts for up to a minute.
    pub async fn run(&self, tree: &Mutex<GpuTree>) -> Result<(), Error> {
        let mut labels = self.extra_labels.clone();
        let model = gpu_model_label(&*tree.lock().await);
        if model.is_empty() {
            warn!("no gpu model detected, skipping model label");
        } else {
            labels.insert(GPU_MODEL_LABEL.to_string(), model);
        }
        if labels.is_empty() {
            return Ok(());
        }

        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({"metadata": {"labels": labels}});
        let mut waited = Duration::ZERO;
        loop {
            match nodes
                .patch(
                    &self.node_name,
                    &PatchParams::default(),
                    &Patch::Strategic(&patch),
                )
                .await
            {
                Ok(_) => {
                    info!(node = self.node_name, "node labels applied");
                    return Ok(());
                }
                Err(kube::Error::Api(response)) if response.code == 409 => {
                    if waited >= RETRY_TIMEOUT {
                        return Err(make_err!(
                            Code::Aborted,
                            "node label patch kept conflicting for {RETRY_TIMEOUT:?}"
                        ));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                    waited += RETRY_INTERVAL;
                }
                Err(err) => {
                    return Err(make_err!(Code::Unavailable, "node label patch failed: {err}"))
                }
            }
        }
    }
}

/// Distinct model tokens over all leaves, e.g. "A100" out of
/// "NVIDIA A100-SXM4-40GB". Assumes homogeneous naming per vendor: the
/// second whitespace-separated word carries the model.
pub fn gpu_model_label(tree: &GpuTree) -> String {
    let mut models = BTreeSet::new();
    for &leaf in tree.leaves() {
        let name = &tree.node(leaf).meta.name;
        if let Some(model) = name.split_whitespace().nth(1) {
            models.insert(model.to_string());
        }
    }
    models.into_iter().collect::<Vec<_>>().join(",")
}
