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

use core::fmt::Write as _;
use core::time::Duration;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vgpu_config::well_known::HUNDRED_CORE;
use vgpu_error::{make_err, make_input_err, Code, Error, ResultExt};

use crate::node::{AllocatableResource, LinkType, NodeIndex, TopoNode};
use crate::probe::{DeviceProbe, ProbeSnapshot};

/// Upper bound on processes tracked per device.
pub const MAX_PROCESS: usize = 64;

type LevelMap = BTreeMap<LinkType, Vec<NodeIndex>>;

/// The device topology tree. Nodes live in an arena; parents and
/// children reference each other by index. The tree itself is not
/// synchronized: callers wrap it in a mutex and hold the guard across
/// every walk or mutation.
pub struct GpuTree {
    nodes: Vec<TopoNode>,
    root: NodeIndex,
    leaves: Vec<NodeIndex>,
    by_device: HashMap<String, NodeIndex>,
    real_mode: bool,
    sample_period: Duration,
    probe: Arc<dyn DeviceProbe>,
    driver_version: (u32, u32),
}

impl core::fmt::Debug for GpuTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GpuTree")
            .field("leaves", &self.leaves.len())
            .field("real_mode", &self.real_mode)
            .finish_non_exhaustive()
    }
}

impl GpuTree {
    /// Builds the tree from the probe, falling back to the textual
    /// topology matrix when the probe is unavailable.
    pub fn init(
        probe: Arc<dyn DeviceProbe>,
        matrix: Option<&str>,
        sample_period: Duration,
    ) -> Result<Self, Error> {
        match probe.describe() {
            Ok(snapshot) => Self::from_snapshot(probe, snapshot, sample_period),
            Err(err) => {
                info!(?err, "device probe unavailable, using text parser");
                let matrix = matrix
                    .err_tip(|| "no topology matrix to fall back to")?;
                Self::from_matrix(probe, matrix, sample_period)
            }
        }
    }

    fn from_snapshot(
        probe: Arc<dyn DeviceProbe>,
        snapshot: ProbeSnapshot,
        sample_period: Duration,
    ) -> Result<Self, Error> {
        let ProbeSnapshot {
            cards,
            links,
            driver_version,
        } = snapshot;
        info!(count = cards.len(), "detected gpu cards");

        let mut tree = Self::empty(probe, sample_period, true, driver_version);
        for (id, card) in cards.into_iter().enumerate() {
            let mut leaf = TopoNode::new_leaf(id);
            leaf.allocatable = AllocatableResource {
                cores: HUNDRED_CORE,
                memory: card.total_memory as i64,
            };
            leaf.meta.minor = card.minor;
            leaf.meta.bus_id = card.bus_id;
            leaf.meta.uuid = card.uuid;
            leaf.meta.name = card.name;
            leaf.meta.total_memory = card.total_memory;
            leaf.meta.capability = card.capability;
            leaf.meta.mig_enabled = tree.probe.mig_enabled(id);
            tree.add_leaf(leaf);
        }

        let mut levels = LevelMap::new();
        for (a, b, link) in links {
            if link == LinkType::Internal {
                continue;
            }
            tree.join(&mut levels, link, a, b)?;
        }
        tree.build(levels)?;
        Ok(tree)
    }

    /// Parses the `nvidia-smi topo -m` style matrix:
    ///
    /// ```text
    ///       GPU0 GPU1 GPU2 GPU3
    /// GPU0   X   PIX  PHB  PHB
    /// ...
    /// ```
    fn from_matrix(
        probe: Arc<dyn DeviceProbe>,
        input: &str,
        sample_period: Duration,
    ) -> Result<Self, Error> {
        let mut lines = input.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .err_tip(|| "empty topology input")?;
        let count = header.split_whitespace().count();
        vgpu_error::error_if!(count == 0, "topology header has no devices");

        let mut tree = Self::empty(probe, sample_period, false, (0, 0));
        for id in 0..count {
            let mut leaf = TopoNode::new_leaf(id);
            leaf.allocatable.cores = HUNDRED_CORE;
            // Text mode has no memory information; the probe owns it.
            leaf.meta.mig_enabled = tree.probe.mig_enabled(id);
            tree.add_leaf(leaf);
        }

        let mut levels = LevelMap::new();
        for (row, line) in lines.enumerate() {
            let card_a = row;
            vgpu_error::error_if!(
                card_a >= count,
                "topology matrix has more rows than devices"
            );
            for (column, token) in line.split_whitespace().enumerate() {
                // Column 0 is the row label, column row+1 the diagonal.
                if column == 0 || column <= card_a + 1 {
                    continue;
                }
                let card_b = column - 1;
                vgpu_error::error_if!(
                    card_b >= count,
                    "topology row {card_a} has more columns than devices"
                );
                let link = LinkType::from_matrix_token(token);
                if link == LinkType::Internal {
                    continue;
                }
                tree.join(&mut levels, link, card_a, card_b)?;
            }
        }
        tree.build(levels)?;
        Ok(tree)
    }

    fn empty(
        probe: Arc<dyn DeviceProbe>,
        sample_period: Duration,
        real_mode: bool,
        driver_version: (u32, u32),
    ) -> Self {
        Self {
            nodes: Vec::new(),
            root: 0,
            leaves: Vec::new(),
            by_device: HashMap::new(),
            real_mode,
            sample_period,
            probe,
            driver_version,
        }
    }

    fn add_leaf(&mut self, leaf: TopoNode) {
        let index = self.nodes.len();
        self.by_device.insert(leaf.minor_name(), index);
        self.nodes.push(leaf);
        self.leaves.push(index);
    }

    /// Merges the pair `(a, b)` into the level's node set: the first node
    /// at that level overlapping either side absorbs the pair, otherwise
    /// a new internal node is created.
    fn join(
        &mut self,
        levels: &mut LevelMap,
        link: LinkType,
        a: usize,
        b: usize,
    ) -> Result<(), Error> {
        let leaf_a = *self
            .leaves
            .get(a)
            .err_tip(|| format!("link references unknown device {a}"))?;
        let leaf_b = *self
            .leaves
            .get(b)
            .err_tip(|| format!("link references unknown device {b}"))?;
        let mask = self.nodes[leaf_a].mask | self.nodes[leaf_b].mask;

        let level_nodes = levels.entry(link).or_default();
        for &existing in level_nodes.iter() {
            if self.nodes[existing].mask & mask != 0 {
                self.nodes[existing].mask |= mask;
                return Ok(());
            }
        }
        let index = self.nodes.len();
        self.nodes.push(TopoNode::new_internal(link, mask));
        debug!(?link, mask = format_args!("{mask:b}"), "new topology node");
        level_nodes.push(index);
        Ok(())
    }

    /// Wires leaves to parents by walking the level sets upward, then
    /// attaches the outermost level to a synthetic root.
    fn build(&mut self, levels: LevelMap) -> Result<(), Error> {
        for leaf_position in 0..self.leaves.len() {
            let mut current = self.leaves[leaf_position];
            for link in LinkType::UPWARD {
                let Some(candidates) = levels.get(&link) else {
                    continue;
                };
                for &upper in candidates {
                    if upper != current && self.nodes[upper].mask & self.nodes[current].mask != 0 {
                        self.set_parent(current, upper);
                        current = upper;
                        break;
                    }
                }
            }
        }

        let root = self.nodes.len();
        self.nodes.push(TopoNode::new_internal(LinkType::System, 0));
        self.root = root;

        let outermost = LinkType::UPWARD
            .iter()
            .rev()
            .find_map(|link| levels.get(link).filter(|nodes| !nodes.is_empty()));
        match outermost {
            Some(nodes) => {
                for &node in nodes {
                    self.nodes[root].mask |= self.nodes[node].mask;
                    self.set_parent(node, root);
                }
            }
            None if self.leaves.len() == 1 => {
                info!("only one card topology");
                let leaf = self.leaves[0];
                self.nodes[root].mask |= self.nodes[leaf].mask;
                self.set_parent(leaf, root);
            }
            None => {
                return Err(make_err!(
                    Code::Internal,
                    "no topology level joins the {} detected devices",
                    self.leaves.len()
                ));
            }
        }
        Ok(())
    }

    fn set_parent(&mut self, child: NodeIndex, parent: NodeIndex) {
        self.nodes[child].parent = Some(parent);
        if !self.nodes[parent].children.contains(&child) {
            self.nodes[parent].children.push(child);
        }
    }

    pub fn node(&self, index: NodeIndex) -> &TopoNode {
        &self.nodes[index]
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn leaves(&self) -> &[NodeIndex] {
        &self.leaves
    }

    pub fn total(&self) -> usize {
        self.leaves.len()
    }

    pub fn real_mode(&self) -> bool {
        self.real_mode
    }

    pub fn driver_version(&self) -> (u32, u32) {
        self.driver_version
    }

    pub fn max_leaf_memory(&self) -> u64 {
        self.leaves
            .iter()
            .map(|&leaf| self.nodes[leaf].meta.total_memory)
            .max()
            .unwrap_or(0)
    }

    /// Looks a leaf up by its `/dev/nvidia<minor>` name.
    pub fn query(&self, device: &str) -> Option<NodeIndex> {
        self.by_device.get(device).copied()
    }

    /// Number of fully free leaves below `index`. The root mask is the
    /// authoritative free set, so intersecting with it answers for any
    /// subtree, including a single leaf.
    pub fn available(&self, index: NodeIndex) -> usize {
        (self.nodes[index].mask & self.nodes[self.root].mask).count_ones() as usize
    }

    /// Fully free leaves below `index`, ascending by device id.
    pub fn available_leaves(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut mask = self.nodes[index].mask & self.nodes[self.root].mask;
        let mut found = Vec::new();
        while mask != 0 {
            let id = mask.trailing_zeros() as usize;
            found.push(self.leaves[id]);
            mask ^= 1 << id;
        }
        found
    }

    /// Reserves `cores` and `memory` on a leaf. Any reservation removes
    /// the leaf from the free set; a request of a whole card or more
    /// zeroes both dimensions.
    pub fn mark_occupied(&mut self, device: &str, cores: i64, memory: i64) -> Result<(), Error> {
        let index = self
            .query(device)
            .err_tip_with_code(|_| (Code::NotFound, format!("no such device {device}")))?;
        debug!(device, cores, memory, "occupy");
        self.occupy_node(index);

        let node = &mut self.nodes[index];
        if cores >= HUNDRED_CORE {
            node.allocatable.cores = 0;
            node.allocatable.memory = 0;
        } else {
            node.allocatable.cores = (node.allocatable.cores - cores).max(0);
            node.allocatable.memory = (node.allocatable.memory - memory).max(0);
        }
        Ok(())
    }

    /// Returns `cores` and `memory` to a leaf. When the shares reach a
    /// whole card again the leaf goes through reset before rejoining the
    /// free set; until the reset succeeds it stays pending and excluded.
    pub fn mark_free(&mut self, device: &str, cores: i64, memory: i64) -> Result<(), Error> {
        let index = self
            .query(device)
            .err_tip_with_code(|_| (Code::NotFound, format!("no such device {device}")))?;
        debug!(device, cores, memory, "free");

        let node = &mut self.nodes[index];
        if cores >= HUNDRED_CORE {
            node.allocatable.cores = HUNDRED_CORE;
            node.allocatable.memory = node.meta.total_memory as i64;
        } else {
            node.allocatable.cores = (node.allocatable.cores + cores).min(HUNDRED_CORE);
            node.allocatable.memory =
                (node.allocatable.memory + memory).min(node.meta.total_memory as i64);
        }

        if self.nodes[index].allocatable.cores == HUNDRED_CORE {
            if self.real_mode {
                self.nodes[index].pending_reset = true;
            }
            if self.attempt_reset(index) {
                self.free_node(index);
            } else {
                warn!(
                    bus_id = self.nodes[index].meta.bus_id,
                    "device not clean after release, waiting for reset"
                );
            }
        }
        Ok(())
    }

    fn occupy_node(&mut self, index: NodeIndex) {
        let bit = self.nodes[index].mask;
        let mut parent = self.nodes[index].parent;
        while let Some(p) = parent {
            if self.nodes[p].mask & bit == bit {
                self.nodes[p].mask ^= bit;
            }
            parent = self.nodes[p].parent;
        }
    }

    fn free_node(&mut self, index: NodeIndex) {
        let bit = self.nodes[index].mask;
        let mut parent = self.nodes[index].parent;
        while let Some(p) = parent {
            self.nodes[p].mask |= bit;
            parent = self.nodes[p].parent;
        }
    }

    /// Tries to clear a pending reset. The reset only runs once no
    /// process remains on the device; failures leave the flag set so the
    /// next update retries.
    fn attempt_reset(&mut self, index: NodeIndex) -> bool {
        if !self.nodes[index].pending_reset {
            return true;
        }
        if !self.real_mode {
            self.nodes[index].pending_reset = false;
            return true;
        }
        let meta = &self.nodes[index].meta;
        if !meta.pids.is_empty() || meta.used_memory > 0 {
            return false;
        }
        match self.probe.reset(meta.id) {
            Ok(()) => {
                self.nodes[index].pending_reset = false;
                true
            }
            Err(err) => {
                warn!(bus_id = self.nodes[index].meta.bus_id, ?err, "can't reset device");
                false
            }
        }
    }

    /// Refreshes per-leaf samples from the probe, retries pending resets
    /// and re-aggregates ancestor totals. A no-op without a live probe.
    pub fn update(&mut self) {
        if !self.real_mode {
            return;
        }
        debug!("update device information");

        for position in 0..self.leaves.len() {
            let index = self.leaves[position];
            let id = self.nodes[index].meta.id;
            match self.probe.sample(id, self.sample_period) {
                Ok(sample) => {
                    let meta = &mut self.nodes[index].meta;
                    meta.pids = sample.pids;
                    meta.pids.truncate(MAX_PROCESS);
                    meta.used_memory = sample.used_memory;
                    meta.utilization = sample.utilization;
                }
                Err(err) => debug!(id, ?err, "can't sample device"),
            }

            if self.nodes[index].pending_reset
                && self.nodes[index].allocatable.cores == HUNDRED_CORE
                && self.attempt_reset(index)
            {
                self.free_node(index);
            }
        }

        self.aggregate(self.root);
    }

    /// Recomputes pids/used/total memory of internal nodes from their
    /// children, post-order.
    fn aggregate(&mut self, index: NodeIndex) {
        let children = self.nodes[index].children.clone();
        if children.is_empty() {
            return;
        }
        let mut pids = Vec::new();
        let mut used_memory = 0u64;
        let mut total_memory = 0u64;
        for child in children {
            self.aggregate(child);
            pids.extend_from_slice(&self.nodes[child].meta.pids);
            used_memory += self.nodes[child].meta.used_memory;
            total_memory += self.nodes[child].meta.total_memory;
        }
        let meta = &mut self.nodes[index].meta;
        meta.pids = pids;
        meta.used_memory = used_memory;
        meta.total_memory = total_memory;
    }

    /// Renders the tree for debug logging.
    pub fn print_graph(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "root:{}", self.available(self.root));
        self.print_iter(&mut out, self.root, 0);
        out
    }

    fn print_iter(&self, out: &mut String, index: NodeIndex, depth: usize) {
        if depth > 0 {
            for _ in 1..depth {
                out.push_str("|   ");
            }
            let node = &self.nodes[index];
            let _ = writeln!(
                out,
                "|---{:?} mask {:b} (aval: {}, pids: {:?}, usedMemory: {}, totalMemory: {}, allocatableCores: {}, allocatableMemory: {})",
                node.link,
                node.mask,
                self.available(index),
                node.meta.pids,
                node.meta.used_memory,
                node.meta.total_memory,
                node.allocatable.cores,
                node.allocatable.memory,
            );
        }
        let mut children = self.nodes[index].children.clone();
        children.sort_by_key(|&child| (self.nodes[child].link, self.nodes[child].meta.minor));
        for child in children {
            self.print_iter(out, child, depth + 1);
        }
    }

    /// Checks the structural invariants; used by tests after mutation
    /// sequences and by startup after checkpoint recovery.
    pub fn check_invariants(&self) -> Result<(), Error> {
        for &leaf in &self.leaves {
            let node = &self.nodes[leaf];
            vgpu_error::error_if!(
                node.allocatable.cores < 0 || node.allocatable.cores > HUNDRED_CORE,
                "leaf {} cores {} out of range",
                node.meta.id,
                node.allocatable.cores
            );
            vgpu_error::error_if!(
                node.allocatable.memory < 0
                    || node.allocatable.memory > node.meta.total_memory as i64,
                "leaf {} memory {} out of range",
                node.meta.id,
                node.allocatable.memory
            );
            let in_root = self.nodes[self.root].mask & node.mask != 0;
            let should = node.allocatable.cores == HUNDRED_CORE && !node.pending_reset;
            vgpu_error::error_if!(
                in_root != should,
                "leaf {} free bit {} disagrees with cores {} (pending_reset {})",
                node.meta.id,
                in_root,
                node.allocatable.cores,
                node.pending_reset
            );
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if node.children.is_empty() {
                continue;
            }
            let child_union: u32 = node
                .children
                .iter()
                .map(|&child| self.nodes[child].mask)
                .fold(0, |acc, mask| acc | mask);
            vgpu_error::error_if!(
                node.mask & child_union != child_union,
                "node {index} mask {:b} does not cover children {:b}",
                node.mask,
                child_union
            );
        }
        Ok(())
    }
}

impl GpuTree {
    /// Convenience used by recovery: re-applies a reservation recorded in
    /// the checkpoint against the freshly built tree.
    pub fn restore_reservation(
        &mut self,
        devices: &[String],
        cores: i64,
        memory: i64,
    ) -> Result<(), Error> {
        vgpu_error::error_if!(devices.is_empty(), "reservation has no devices");
        if cores >= HUNDRED_CORE {
            let per_card_memory = memory / devices.len() as i64;
            for device in devices {
                self.mark_occupied(device, HUNDRED_CORE, per_card_memory)
                    .err_tip(|| "while restoring exclusive reservation")?;
            }
        } else {
            vgpu_error::error_if!(
                devices.len() != 1,
                "fractional reservation spans {} devices",
                devices.len()
            );
            self.mark_occupied(&devices[0], cores, memory)
                .err_tip(|| "while restoring shared reservation")?;
        }
        Ok(())
    }
}

/// Guard rail for `mark_occupied` callers: a fractional request must fit
/// one card.
pub fn validate_request(cores: i64, memory: i64) -> Result<(), Error> {
    vgpu_error::error_if!(cores <= 0, "request has no compute shares");
    if cores > HUNDRED_CORE && cores % HUNDRED_CORE != 0 {
        return Err(make_input_err!(
            "multi-card request must be a multiple of {HUNDRED_CORE} shares, got {cores}"
        ));
    }
    vgpu_error::error_if!(
        cores < HUNDRED_CORE && memory <= 0,
        "fractional request must carry a memory quota"
    );
    Ok(())
}
