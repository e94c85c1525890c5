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

//! The allocation pipeline behind the `vcuda-core` resource: map each
//! kubelet request to a pending pod container, run a placement policy,
//! mark the tree, hand the pod to the virtual manager, and persist the
//! reservation before the response leaves the daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use prost::Message as _;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};
use vgpu_config::well_known::{
    DEVICE_MINORS_ENV, DRIVER_LIBRARY_MOUNTPOINT, HUNDRED_CORE, MEMORY_BLOCK_SIZE,
    NVIDIA_CTL_DEVICE, NVIDIA_DEVICE_PREFIX, NVIDIA_UVM_DEVICE, POD_UID_ENV, VCORE_RESOURCE,
    VCUDA_MOUNTPOINT, VMEMORY_RESOURCE,
};
use vgpu_config::Config;
use vgpu_error::{make_err, Code, Error, ResultExt};
use vgpu_proto::deviceplugin::v1beta1::{
    AllocateResponse, ContainerAllocateRequest, ContainerAllocateResponse, DeviceSpec, Mount,
};
use vgpu_topology::policy::{FragmentPolicy, LinkPolicy, Placement, SharePolicy};
use vgpu_topology::tree::GpuTree;
use vgpu_topology::NodeIndex;

use crate::checkpoint::{Checkpoint, CheckpointStore, PodDevicesEntry};
use crate::response::{CachedAllocation, ResponseCache};
use crate::watchdog::{
    bind_time, container_resource_limit, creation_time, is_gpu_required_container,
    pod_was_rejected, PodSource,
};

/// Hand-off from a granted allocation to the virtual-manager dispatcher:
/// the per-pod directory and socket must exist before the kubelet starts
/// the container, so the producer blocks on `done`.
#[derive(Debug)]
pub struct VDeviceEvent {
    pub pod_uid: String,
    pub done: oneshot::Sender<Result<(), Error>>,
}

pub struct Allocator {
    config: Arc<Config>,
    tree: Arc<Mutex<GpuTree>>,
    cache: Arc<ResponseCache>,
    checkpoint: CheckpointStore,
    pods: Arc<dyn PodSource>,
    vdevice_tx: mpsc::Sender<VDeviceEvent>,
}

impl Allocator {
    pub fn new(
        config: Arc<Config>,
        tree: Arc<Mutex<GpuTree>>,
        cache: Arc<ResponseCache>,
        checkpoint: CheckpointStore,
        pods: Arc<dyn PodSource>,
        vdevice_tx: mpsc::Sender<VDeviceEvent>,
    ) -> Self {
        Self {
            config,
            tree,
            cache,
            checkpoint,
            pods,
            vdevice_tx,
        }
    }

    /// Serves one kubelet `Allocate` call for the core resource.
    pub async fn allocate(
        &self,
        requests: Vec<ContainerAllocateRequest>,
    ) -> Result<AllocateResponse, Error> {
        let mut container_responses = Vec::with_capacity(requests.len());
        for request in requests {
            let cores = request.device_ids.len() as i64;
            let response = self
                .allocate_one(&request)
                .await
                .err_tip(|| format!("while allocating {cores} shares"))?;
            container_responses.push(response);
        }
        Ok(AllocateResponse {
            container_responses,
        })
    }

    async fn allocate_one(
        &self,
        request: &ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse, Error> {
        let cores = request.device_ids.len() as i64;
        vgpu_error::error_if!(cores == 0, "allocate request carries no device ids");

        let (pod_uid, annotations, container_name, memory_blocks) =
            self.pick_candidate(cores)?;
        let requested_memory = memory_blocks * MEMORY_BLOCK_SIZE as i64;
        vgpu_topology::tree::validate_request(cores, requested_memory)?;

        // Placement and bookkeeping happen under one tree guard so the
        // policy's snapshot is the state the marks apply to.
        let (chosen, reserved_memory) = {
            let mut tree = self.tree.lock().await;
            let policy: &dyn Placement = if cores < HUNDRED_CORE {
                vgpu_error::error_if!(
                    !self.config.enable_share,
                    "fractional request for {cores} shares but share mode is disabled"
                );
                &SharePolicy
            } else if cores == HUNDRED_CORE {
                &FragmentPolicy
            } else {
                &LinkPolicy
            };

            let picked = policy.evaluate(&tree, cores, requested_memory, &annotations);
            if picked.is_empty() {
                return Err(make_err!(
                    Code::ResourceExhausted,
                    "no device satisfies {cores} shares / {memory_blocks} blocks for pod {pod_uid}"
                ));
            }

            let chosen: Vec<ChosenLeaf> = picked
                .iter()
                .map(|&leaf| ChosenLeaf::from_tree(&tree, leaf))
                .collect();
            let reserved_memory = if cores >= HUNDRED_CORE {
                let mut total = 0;
                for leaf in &chosen {
                    tree.mark_occupied(&leaf.device, HUNDRED_CORE, leaf.total_memory as i64)?;
                    total += leaf.total_memory as i64;
                }
                total
            } else {
                tree.mark_occupied(&chosen[0].device, cores, requested_memory)?;
                requested_memory
            };
            (chosen, reserved_memory)
        };

        let response = self.build_response(&pod_uid, &chosen);
        info!(
            pod_uid,
            container_name,
            cores,
            memory = reserved_memory,
            devices = ?chosen.iter().map(|leaf| leaf.device.as_str()).collect::<Vec<_>>(),
            "allocation granted"
        );

        self.cache.insert(
            &pod_uid,
            &container_name,
            CachedAllocation {
                devices: chosen.iter().map(|leaf| leaf.device.clone()).collect(),
                core_ids: request.device_ids.clone(),
                cores,
                memory: reserved_memory,
                response: response.clone(),
                created_at: SystemTime::now(),
            },
        )?;

        if let Err(err) = self.notify_virtual_manager(&pod_uid).await {
            warn!(pod_uid, ?err, "virtual manager setup failed, rolling back");
            self.rollback(&pod_uid, &container_name, &chosen, cores, reserved_memory)
                .await;
            return Err(err);
        }

        self.persist_checkpoint()
            .await
            .err_tip(|| "while checkpointing the reservation")?;
        Ok(response)
    }

    /// Matches the request to the pending container it was issued for.
    ///
    /// The kubelet does not say which container an `Allocate` belongs
    /// to, so the share count is matched against container limits over
    /// the node's pending pods, oldest bind first. When two containers
    /// of one pod request identical counts the first in declaration
    /// order is taken.
    fn pick_candidate(
        &self,
        cores: i64,
    ) -> Result<
        (
            String,
            std::collections::BTreeMap<String, String>,
            String,
            i64,
        ),
        Error,
    > {
        let mut candidates: Vec<_> = self
            .pods
            .active_pods()
            .into_values()
            .filter(|pod| !pod_was_rejected(pod))
            .collect();
        candidates.sort_by_key(|pod| (bind_time(pod), creation_time(pod)));

        for pod in candidates {
            let Some(uid) = pod.metadata.uid.clone() else {
                continue;
            };
            let containers = pod
                .spec
                .as_ref()
                .map(|spec| spec.containers.as_slice())
                .unwrap_or_default();
            for container in containers {
                if !is_gpu_required_container(container) {
                    continue;
                }
                if container_resource_limit(container, VCORE_RESOURCE) != cores {
                    continue;
                }
                if self.cache.contains(&uid, &container.name)? {
                    continue;
                }
                return Ok((
                    uid,
                    pod.metadata.annotations.clone().unwrap_or_default(),
                    container.name.clone(),
                    container_resource_limit(container, VMEMORY_RESOURCE),
                ));
            }
        }
        Err(make_err!(
            Code::NotFound,
            "no pending container on this node requests {cores} shares"
        ))
    }

    fn build_response(&self, pod_uid: &str, chosen: &[ChosenLeaf]) -> ContainerAllocateResponse {
        let mut devices = vec![
            device_spec(NVIDIA_CTL_DEVICE),
            device_spec(NVIDIA_UVM_DEVICE),
        ];
        for leaf in chosen {
            devices.push(device_spec(&leaf.device));
        }

        let pod_dir = self.config.virtual_manager_path.join(pod_uid);
        let mounts = vec![
            Mount {
                container_path: VCUDA_MOUNTPOINT.to_string(),
                host_path: pod_dir.to_string_lossy().into_owned(),
                read_only: false,
            },
            Mount {
                container_path: DRIVER_LIBRARY_MOUNTPOINT.to_string(),
                host_path: self.config.driver_library_path.to_string_lossy().into_owned(),
                read_only: true,
            },
        ];

        let minors = chosen
            .iter()
            .map(|leaf| leaf.minor.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let envs = HashMap::from([
            (POD_UID_ENV.to_string(), pod_uid.to_string()),
            (DEVICE_MINORS_ENV.to_string(), minors),
            // The runtime library, not the vendor runtime, exposes the
            // device files.
            ("NVIDIA_VISIBLE_DEVICES".to_string(), "none".to_string()),
        ]);

        ContainerAllocateResponse {
            envs,
            mounts,
            devices,
            annotations: HashMap::new(),
        }
    }

    async fn notify_virtual_manager(&self, pod_uid: &str) -> Result<(), Error> {
        let (done, done_rx) = oneshot::channel();
        self.vdevice_tx
            .send(VDeviceEvent {
                pod_uid: pod_uid.to_string(),
                done,
            })
            .await
            .map_err(|_| make_err!(Code::Unavailable, "virtual manager is gone"))?;
        tokio::time::timeout(self.config.wait_timeout, done_rx)
            .await
            .map_err(Error::from)?
            .map_err(|_| make_err!(Code::Internal, "virtual manager dropped the request"))?
    }

    async fn rollback(
        &self,
        pod_uid: &str,
        container_name: &str,
        chosen: &[ChosenLeaf],
        cores: i64,
        memory: i64,
    ) {
        let mut tree = self.tree.lock().await;
        if cores >= HUNDRED_CORE {
            for leaf in chosen {
                if let Err(err) = tree.mark_free(&leaf.device, HUNDRED_CORE, leaf.total_memory as i64)
                {
                    warn!(?err, device = leaf.device, "rollback free failed");
                }
            }
        } else if let Err(err) = tree.mark_free(&chosen[0].device, cores, memory) {
            warn!(?err, device = chosen[0].device, "rollback free failed");
        }
        drop(tree);
        if let Err(err) = self.cache.delete(pod_uid, container_name) {
            warn!(?err, pod_uid, "rollback cache delete failed");
        }
    }

    /// Serializes the whole cache into the kubelet-format checkpoint.
    pub async fn persist_checkpoint(&self) -> Result<(), Error> {
        let registered_devices = {
            let tree = self.tree.lock().await;
            HashMap::from([
                (
                    VCORE_RESOURCE.to_string(),
                    core_device_ids(tree.total()),
                ),
                (
                    VMEMORY_RESOURCE.to_string(),
                    memory_device_ids(total_memory_blocks(
                        &tree,
                        self.config.device_memory_scaling,
                    )),
                ),
            ])
        };

        let mut pod_device_entries = Vec::new();
        for (pod_uid, containers) in self.cache.list_all()? {
            for (container_name, allocation) in containers {
                let mut alloc_resp = Vec::new();
                allocation.response.encode(&mut alloc_resp)?;
                pod_device_entries.push(PodDevicesEntry {
                    pod_uid: pod_uid.clone(),
                    container_name: container_name.clone(),
                    resource_name: VCORE_RESOURCE.to_string(),
                    device_ids: allocation.core_ids.clone(),
                    alloc_resp,
                });
                pod_device_entries.push(PodDevicesEntry {
                    pod_uid: pod_uid.clone(),
                    container_name,
                    resource_name: VMEMORY_RESOURCE.to_string(),
                    device_ids: memory_device_ids(
                        (allocation.memory / MEMORY_BLOCK_SIZE as i64).max(0) as usize,
                    ),
                    alloc_resp: Vec::new(),
                });
            }
        }
        pod_device_entries.sort_by(|a, b| {
            (&a.pod_uid, &a.container_name, &a.resource_name)
                .cmp(&(&b.pod_uid, &b.container_name, &b.resource_name))
        });

        self.checkpoint.save(&Checkpoint {
            pod_device_entries,
            registered_devices,
        })
    }

    /// Rebuilds the cache and the tree from the checkpoint written by a
    /// previous incarnation. Entries whose pod died while the daemon was
    /// down are skipped; entries that do not match the current device
    /// list are an integrity failure and abort startup.
    pub async fn recover(&self) -> Result<(), Error> {
        let Some(checkpoint) = self.checkpoint.load()? else {
            return Ok(());
        };
        let active = self.pods.active_pods();

        #[derive(Default)]
        struct Recovered {
            core_ids: Vec<String>,
            memory_blocks: i64,
            alloc_resp: Vec<u8>,
        }
        let mut grouped: HashMap<(String, String), Recovered> = HashMap::new();
        for entry in checkpoint.pod_device_entries {
            let slot = grouped
                .entry((entry.pod_uid, entry.container_name))
                .or_default();
            match entry.resource_name.as_str() {
                VCORE_RESOURCE => {
                    slot.core_ids = entry.device_ids;
                    slot.alloc_resp = entry.alloc_resp;
                }
                VMEMORY_RESOURCE => slot.memory_blocks = entry.device_ids.len() as i64,
                _ => {}
            }
        }

        let mut recovered = 0usize;
        for ((pod_uid, container_name), entry) in grouped {
            if entry.core_ids.is_empty() {
                continue;
            }
            if !active.contains_key(&pod_uid) {
                info!(pod_uid, "skipping checkpoint entry for dead pod");
                continue;
            }
            let response = ContainerAllocateResponse::decode(entry.alloc_resp.as_slice())
                .err_tip_with_code(|_| {
                    (
                        Code::Internal,
                        format!("undecodable allocation response for pod {pod_uid}"),
                    )
                })?;
            let devices = response_device_names(&response);
            vgpu_error::error_if!(
                devices.is_empty(),
                "checkpoint entry for pod {pod_uid} names no devices"
            );

            let cores = entry.core_ids.len() as i64;
            let memory = entry.memory_blocks * MEMORY_BLOCK_SIZE as i64;
            {
                let mut tree = self.tree.lock().await;
                for device in &devices {
                    vgpu_error::error_if!(
                        tree.query(device).is_none(),
                        "checkpoint references {device} which is not on this node"
                    );
                }
                let memory = if cores >= HUNDRED_CORE {
                    devices
                        .iter()
                        .map(|device| {
                            let leaf = tree.query(device).expect("checked above");
                            tree.node(leaf).meta.total_memory as i64
                        })
                        .sum()
                } else {
                    memory
                };
                tree.restore_reservation(&devices, cores, memory)?;
                tree.check_invariants()?;
            }

            self.cache.insert(
                &pod_uid,
                &container_name,
                CachedAllocation {
                    devices,
                    core_ids: entry.core_ids,
                    cores,
                    memory,
                    response,
                    created_at: SystemTime::now(),
                },
            )?;
            recovered += 1;
        }
        info!(recovered, "checkpoint recovery finished");
        Ok(())
    }

    /// Periodically drops reservations whose pod left the cluster or was
    /// rejected at admission, freeing their devices.
    pub async fn run_reclaimer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.allocation_check_period);
        loop {
            ticker.tick().await;
            if let Err(err) = self.reclaim_once().await {
                warn!(?err, "reservation sweep failed");
            }
        }
    }

    pub async fn reclaim_once(&self) -> Result<(), Error> {
        let active = self.pods.active_pods();
        let mut dropped_any = false;

        for (pod_uid, containers) in self.cache.list_all()? {
            let keep = active
                .get(&pod_uid)
                .map(|pod| !pod_was_rejected(pod))
                .unwrap_or(false);
            if keep {
                continue;
            }
            info!(pod_uid, "dropping reservations of inactive pod");
            for (container_name, allocation) in containers {
                let mut tree = self.tree.lock().await;
                if allocation.cores >= HUNDRED_CORE {
                    let per_card = allocation.memory / allocation.devices.len().max(1) as i64;
                    for device in &allocation.devices {
                        if let Err(err) = tree.mark_free(device, HUNDRED_CORE, per_card) {
                            warn!(?err, device, "can't free device");
                        }
                    }
                } else if let Err(err) = tree.mark_free(
                    &allocation.devices[0],
                    allocation.cores,
                    allocation.memory,
                ) {
                    warn!(?err, device = allocation.devices[0], "can't free device");
                }
                drop(tree);
                self.cache.delete(&pod_uid, &container_name)?;
                dropped_any = true;
            }
        }

        if dropped_any {
            self.persist_checkpoint().await?;
        }
        Ok(())
    }
}

/// Leaf facts captured under the tree lock for response building.
#[derive(Debug, Clone)]
struct ChosenLeaf {
    device: String,
    minor: usize,
    total_memory: u64,
}

impl ChosenLeaf {
    fn from_tree(tree: &GpuTree, leaf: NodeIndex) -> Self {
        let node = tree.node(leaf);
        Self {
            device: node.minor_name(),
            minor: node.meta.minor,
            total_memory: node.meta.total_memory,
        }
    }
}

fn device_spec(path: &str) -> DeviceSpec {
    DeviceSpec {
        container_path: path.to_string(),
        host_path: path.to_string(),
        permissions: "rwm".to_string(),
    }
}

/// `/dev/nvidia<minor>` entries of an allocate response, skipping the
/// control and uvm devices.
pub fn response_device_names(response: &ContainerAllocateResponse) -> Vec<String> {
    response
        .devices
        .iter()
        .filter_map(|device| {
            let path = device.host_path.as_str();
            path.strip_prefix(NVIDIA_DEVICE_PREFIX)
                .and_then(|suffix| suffix.parse::<usize>().ok())
                .map(|_| path.to_string())
        })
        .collect()
}

pub fn core_device_ids(cards: usize) -> Vec<String> {
    (0..cards * HUNDRED_CORE as usize)
        .map(|index| format!("core-{index}"))
        .collect()
}

pub fn memory_device_ids(blocks: usize) -> Vec<String> {
    (0..blocks).map(|index| format!("memory-{index}")).collect()
}

/// Advertised memory blocks over all cards, after scaling.
pub fn total_memory_blocks(tree: &GpuTree, scaling: f64) -> usize {
    tree.leaves()
        .iter()
        .map(|&leaf| {
            let total = tree.node(leaf).meta.total_memory as f64 * scaling;
            (total as u64 / MEMORY_BLOCK_SIZE) as usize
        })
        .sum()
}
