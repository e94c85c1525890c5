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
use vgpu_config::well_known::HUNDRED_CORE;

use crate::node::NodeIndex;
use crate::policy::{compare_nodes, device_type_allowed, Placement};
use crate::tree::GpuTree;

/// Multi-card placement that minimizes connection overhead: every leaf
/// nominates the smallest enclosing subtree that can hold the whole
/// request, and the closest-knit nominee wins.
#[derive(Debug, Default)]
pub struct LinkPolicy;

impl Placement for LinkPolicy {
    fn evaluate(
        &self,
        tree: &GpuTree,
        cores: i64,
        _memory: i64,
        annotations: &BTreeMap<String, String>,
    ) -> Vec<NodeIndex> {
        let mut wanted = (cores / HUNDRED_CORE) as usize;
        let root = tree.root();
        let mut candidates: Vec<NodeIndex> = Vec::new();

        for &leaf in tree.leaves() {
            let mut current = leaf;
            while current != root {
                if tree.available(current) < wanted {
                    match tree.node(current).parent {
                        Some(parent) => current = parent,
                        None => break,
                    }
                    continue;
                }
                if !candidates.contains(&current) {
                    debug!(
                        mask = format_args!("{:b}", tree.node(current).mask),
                        "link candidate"
                    );
                    candidates.push(current);
                }
                break;
            }
        }

        if candidates.is_empty() {
            candidates.push(root);
        }
        candidates.sort_by(|&a, &b| compare_nodes(tree, a, b, true, true, false));

        let mut picked = Vec::new();
        for leaf in tree.available_leaves(candidates[0]) {
            if wanted == 0 {
                break;
            }
            if !device_type_allowed(annotations, &tree.node(leaf).meta.name) {
                debug!(
                    minor = tree.node(leaf).meta.minor,
                    name = tree.node(leaf).meta.name,
                    "device model rejected by pod annotations"
                );
                continue;
            }
            picked.push(leaf);
            wanted -= 1;
        }

        if wanted > 0 {
            return Vec::new();
        }
        picked
    }
}
