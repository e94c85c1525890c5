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

//! Placement policies. Each policy decides which leaves fulfill a
//! `(cores, memory)` request against a consistent snapshot of the tree;
//! the caller holds the tree lock for the duration of the call and marks
//! the returned leaves occupied under the same guard.

use std::collections::BTreeMap;

use vgpu_config::well_known::{NOUSE_GPUTYPE_ANNOTATION, USE_GPUTYPE_ANNOTATION};

use crate::node::NodeIndex;
use crate::tree::GpuTree;

mod fragment;
mod link;
mod share;

pub use fragment::FragmentPolicy;
pub use link::LinkPolicy;
pub use share::SharePolicy;

pub trait Placement: Send + Sync {
    /// Returns the leaves that fulfill the request, or empty when the
    /// request does not fit. Policies never mutate the tree.
    fn evaluate(
        &self,
        tree: &GpuTree,
        cores: i64,
        memory: i64,
        annotations: &BTreeMap<String, String>,
    ) -> Vec<NodeIndex>;
}

/// Applies the `use-gputype` / `nouse-gputype` pod annotations: the
/// device passes when any `use` entry matches (or none is listed) and no
/// `nouse` entry matches. Matching is case-insensitive substring.
pub fn device_type_allowed(annotations: &BTreeMap<String, String>, device_name: &str) -> bool {
    let device_name = device_name.to_uppercase();
    if let Some(wanted) = annotations.get(USE_GPUTYPE_ANNOTATION) {
        if !wanted
            .split(',')
            .any(|entry| device_name.contains(&entry.trim().to_uppercase()))
        {
            return false;
        }
    }
    if let Some(unwanted) = annotations.get(NOUSE_GPUTYPE_ANNOTATION) {
        if unwanted
            .split(',')
            .any(|entry| !entry.trim().is_empty() && device_name.contains(&entry.trim().to_uppercase()))
        {
            return false;
        }
    }
    true
}

/// Ascending comparison chain shared by the policies: packing demand
/// into already-partial devices keeps whole cards intact for future
/// multi-card requests, and the minor id keeps results deterministic.
pub(crate) fn compare_nodes(
    tree: &GpuTree,
    a: NodeIndex,
    b: NodeIndex,
    by_type: bool,
    by_available: bool,
    by_cores: bool,
) -> core::cmp::Ordering {
    use core::cmp::Ordering;
    let (na, nb) = (tree.node(a), tree.node(b));
    let mut ordering = Ordering::Equal;
    if by_type {
        ordering = na.link.cmp(&nb.link);
    }
    if ordering == Ordering::Equal && by_available {
        ordering = tree.available(a).cmp(&tree.available(b));
    }
    if ordering == Ordering::Equal && by_cores {
        ordering = na.allocatable.cores.cmp(&nb.allocatable.cores);
    }
    ordering
        .then(na.allocatable.memory.cmp(&nb.allocatable.memory))
        .then(na.meta.pids.len().cmp(&nb.meta.pids.len()))
        .then(na.meta.minor.cmp(&nb.meta.minor))
}
