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

/// Whole-card placement that burns down the most fragmented subtree
/// first: descending always into the least-available child that still
/// fits keeps the larger groups intact for link-mode requests.
#[derive(Debug, Default)]
pub struct FragmentPolicy;

impl Placement for FragmentPolicy {
    fn evaluate(
        &self,
        tree: &GpuTree,
        cores: i64,
        _memory: i64,
        annotations: &BTreeMap<String, String>,
    ) -> Vec<NodeIndex> {
        let mut wanted = (cores / HUNDRED_CORE) as usize;
        let mut candidate = tree.root();

        loop {
            let mut children = tree.node(candidate).children.clone();
            children.sort_by(|&a, &b| compare_nodes(tree, a, b, false, true, false));

            let next = children.into_iter().find(|&child| {
                !tree.node(child).children.is_empty() && tree.available(child) >= wanted
            });
            match next {
                Some(child) => {
                    debug!(
                        mask = format_args!("{:b}", tree.node(child).mask),
                        "fragment descend"
                    );
                    candidate = child;
                }
                None => break,
            }
        }

        let mut picked = Vec::new();
        for leaf in tree.available_leaves(candidate) {
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
