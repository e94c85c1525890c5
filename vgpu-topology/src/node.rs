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

use vgpu_config::well_known::{HUNDRED_CORE, NVIDIA_DEVICE_PREFIX};

/// Index of a node in the tree arena. Nodes never move once created, so
/// an index stays valid for the lifetime of the tree.
pub type NodeIndex = usize;

/// Interconnect distance between two devices, closest first. The variant
/// order is load-bearing: placement sorts candidates by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkType {
    /// Same device or same multi-GPU board.
    Internal,
    /// Single PCIe switch (PIX).
    Single,
    /// Multiple PCIe switches (PXB).
    Multiple,
    /// PCIe host bridge (PHB).
    HostBridge,
    /// Same CPU socket (SOC).
    Cpu,
    /// Across sockets.
    System,
}

impl LinkType {
    /// Levels a leaf walks through when wiring itself to parents.
    pub const UPWARD: [Self; 5] = [
        Self::Single,
        Self::Multiple,
        Self::HostBridge,
        Self::Cpu,
        Self::System,
    ];

    /// Maps a `nvidia-smi topo -m` cell to its level. Unknown tokens map
    /// to `System` so a malformed matrix degrades instead of panicking.
    pub fn from_matrix_token(token: &str) -> Self {
        match token {
            "PIX" => Self::Single,
            "PXB" => Self::Multiple,
            "PHB" => Self::HostBridge,
            "SOC" | "SYS" => Self::Cpu,
            other if other.starts_with("GPU") || other == "X" => Self::Internal,
            _ => Self::System,
        }
    }
}

/// Compute shares and memory still unreserved on a leaf.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatableResource {
    /// Shares out of [`HUNDRED_CORE`].
    pub cores: i64,
    /// Bytes.
    pub memory: i64,
}

/// Identity and live sampling data. Only meaningful on leaves.
#[derive(Debug, Default, Clone)]
pub struct DeviceMeta {
    /// Dense device index, equal to the position in the leaf array.
    pub id: usize,
    /// Minor number of `/dev/nvidia<minor>`.
    pub minor: usize,
    pub bus_id: String,
    pub uuid: String,
    /// Marketing name, e.g. "NVIDIA A100-SXM4-40GB".
    pub name: String,
    pub total_memory: u64,
    pub used_memory: u64,
    pub pids: Vec<u32>,
    pub utilization: u32,
    /// CUDA compute capability, `(major, minor)`.
    pub capability: (u32, u32),
    /// Conservatively true when the probe cannot rule MIG out.
    pub mig_enabled: bool,
}

/// One node of the topology tree.
#[derive(Debug, Clone)]
pub struct TopoNode {
    pub link: LinkType,
    /// Bit per leaf reachable below this node. The leaf's own bit never
    /// changes; ancestors drop it while the leaf has any tenant.
    pub mask: u32,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    pub allocatable: AllocatableResource,
    pub meta: DeviceMeta,
    /// Set when the leaf's shares return to a full card; cleared only by
    /// a successful reset with no processes left on the device.
    pub pending_reset: bool,
}

impl TopoNode {
    pub fn new_leaf(id: usize) -> Self {
        Self {
            link: LinkType::Internal,
            mask: 1 << id,
            parent: None,
            children: Vec::new(),
            allocatable: AllocatableResource::default(),
            meta: DeviceMeta {
                id,
                minor: id,
                ..DeviceMeta::default()
            },
            pending_reset: false,
        }
    }

    pub fn new_internal(link: LinkType, mask: u32) -> Self {
        Self {
            link,
            mask,
            parent: None,
            children: Vec::new(),
            allocatable: AllocatableResource::default(),
            meta: DeviceMeta::default(),
            pending_reset: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.link == LinkType::Internal
    }

    /// `/dev/nvidia<minor>`, the name reservations are keyed by.
    pub fn minor_name(&self) -> String {
        format!("{NVIDIA_DEVICE_PREFIX}{}", self.meta.minor)
    }

    /// Whether the leaf currently has no tenants at all.
    pub fn fully_free(&self) -> bool {
        self.allocatable.cores >= HUNDRED_CORE
    }
}
