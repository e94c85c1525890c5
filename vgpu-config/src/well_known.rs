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

//! Resource names, annotation keys and file names shared across the
//! daemon. These are part of the external contract; renaming any of them
//! breaks scheduled pods or the in-container client.

/// Compute resource advertised to the kubelet, 100 units per card.
pub const VCORE_RESOURCE: &str = "nvidia.com/vcuda-core";
/// Memory resource advertised to the kubelet, one unit per block.
pub const VMEMORY_RESOURCE: &str = "nvidia.com/vcuda-memory";

/// One memory block in bytes (1 MiB).
pub const MEMORY_BLOCK_SIZE: u64 = 1_048_576;
/// A whole card worth of compute shares.
pub const HUNDRED_CORE: i64 = 100;

/// Pod annotation capping compute even when share mode rounds up.
pub const VCORE_LIMIT_ANNOTATION: &str = "nvidia.com/vcuda-core-limit";
/// Pod annotation restricting placement to matching device models.
pub const USE_GPUTYPE_ANNOTATION: &str = "nvidia.com/use-gputype";
/// Pod annotation excluding matching device models from placement.
pub const NOUSE_GPUTYPE_ANNOTATION: &str = "nvidia.com/nouse-gputype";
/// Pod label carrying the scheduler's bind timestamp.
pub const BIND_TIME_LABEL: &str = "tydic.io/bind-time";

/// Node label for the detected device model.
pub const GPU_MODEL_LABEL: &str = "gaia.nvidia.com/gpu-model";
/// Node annotation refreshed as a liveness heartbeat.
pub const HEARTBEAT_ANNOTATION: &str = "tydic.io/node-gpu-heartbeat";
/// Node annotation carrying the JSON device inventory.
pub const DEVICE_REGISTER_ANNOTATION: &str = "tydic.io/nvidia-device-register";

/// In-container mount point of the per-pod host directory.
pub const VCUDA_MOUNTPOINT: &str = "/etc/vcuda";
/// In-container mount point of the runtime library volume.
pub const DRIVER_LIBRARY_MOUNTPOINT: &str = "/usr/local/vgpu";
/// Socket file inside each per-pod directory.
pub const VDEVICE_SOCKET: &str = "vcuda.sock";
/// Per-resource plugin endpoints under the kubelet plugin directory.
pub const VCORE_SOCKET: &str = "vcore.sock";
pub const VMEMORY_SOCKET: &str = "vmemory.sock";

/// Checkpoint file name, kept identical to the kubelet's own.
pub const CHECKPOINT_FILE_NAME: &str = "kubelet_internal_checkpoint";

/// Environment passed into allocated containers.
pub const POD_UID_ENV: &str = "VCUDA_POD_UID";
pub const DEVICE_MINORS_ENV: &str = "VCUDA_DEVICE_MINORS";

/// Container state markers used to detect rejected pods.
pub const PRE_START_CHECK_ERR_MSG: &str = "PreStartContainer check failed";
pub const UNEXPECTED_ADMISSION_ERR_TYPE: &str = "UnexpectedAdmissionError";

/// Labels the CRI runtime places on kubelet-managed containers.
pub const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
pub const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";

/// Host device files mounted into every allocated container.
pub const NVIDIA_CTL_DEVICE: &str = "/dev/nvidiactl";
pub const NVIDIA_UVM_DEVICE: &str = "/dev/nvidia-uvm";
pub const NVIDIA_DEVICE_PREFIX: &str = "/dev/nvidia";
