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

use std::collections::BTreeMap;

use tracing::debug;

use crate::node::NodeIndex;
use crate::policy::{compare_nodes, device_type_allowed, Placement};
use crate::tree::GpuTree;

/// Fractional placement: multiple tenants share one device. Picks the
/// single leaf with the fewest shares left that still fits both
/// dimensions, so partially used cards fill up before fresh ones are
/// broken open. MIG-enabled devices never take shared tenants.
#[derive(Debug, Default)]
pub struct SharePolicy;

impl Placement for SharePolicy {
    fn evaluate(
        &self,
        tree: &GpuTree,
        cores: i64,
        memory: i64,
        annotations: &BTreeMap<String, String>,
    ) -> Vec<NodeIndex> {
        let mut leaves = tree.leaves().to_vec();
        leaves.sort_by(|&a, &b| compare_nodes(tree, a, b, false, false, true));

        for leaf in leaves {
            let node = tree.node(leaf);
            if node.allocatable.cores < cores || node.allocatable.memory < memory {
                continue;
            }
            if node.meta.mig_enabled {
                debug!(minor = node.meta.minor, "skipping mig-enabled device");
                continue;
            }
            if !device_type_allowed(annotations, &node.meta.name) {
                debug!(
                    minor = node.meta.minor,
                    name = node.meta.name,
                    "device model rejected by pod annotations"
                );
                continue;
            }
            debug!(
                minor = node.meta.minor,
                cores = node.allocatable.cores,
                memory = node.allocatable.memory,
                "share pick"
            );
            return vec![leaf];
        }

        Vec::new()
    }
}
