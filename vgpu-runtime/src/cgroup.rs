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

//! Memory-cgroup path construction for kubelet-managed containers.
//!
//! The layout depends on the cgroup driver, the container runtime and
//! the runtime's age. Rather than probing one convention and retrying,
//! every plausible path is enumerated (newest first) and the first one
//! that exists on disk wins.

use core::str::FromStr;
use std::path::{Path, PathBuf};

use vgpu_config::CgroupDriver;
use vgpu_error::{make_err, make_input_err, Code, Error, ResultExt};
use walkdir::WalkDir;

/// Default mount point of the memory cgroup controller.
pub const CGROUP_MEMORY_ROOT: &str = "/sys/fs/cgroup/memory";
const CGROUP_PROCS: &str = "cgroup.procs";
const POD_CGROUP_PREFIX: &str = "pod";
/// `8-4-4-4-12` textual uuid.
const UID_LEN: usize = 36;

/// Kubernetes quality-of-service class; decides which intermediate
/// cgroup a pod lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl QosClass {
    fn segment(self) -> Option<&'static str> {
        match self {
            Self::Guaranteed => None,
            Self::Burstable => Some("burstable"),
            Self::BestEffort => Some("besteffort"),
        }
    }
}

impl FromStr for QosClass {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Error> {
        match value {
            "Guaranteed" => Ok(Self::Guaranteed),
            "Burstable" => Ok(Self::Burstable),
            "BestEffort" => Ok(Self::BestEffort),
            other => Err(make_input_err!("unknown qos class {other}")),
        }
    }
}

/// Which runtime convention the container id is wrapped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFlavor {
    Docker,
    Containerd,
}

impl RuntimeFlavor {
    pub fn from_runtime_name(name: &str) -> Result<Self, Error> {
        match name {
            "docker" => Ok(Self::Docker),
            "containerd" => Ok(Self::Containerd),
            other => Err(make_err!(
                Code::Unimplemented,
                "unsupported container runtime {other}"
            )),
        }
    }

    fn scope_prefix(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Containerd => "cri-containerd",
        }
    }
}

/// Everything needed to locate one container's memory cgroup.
#[derive(Debug, Clone)]
pub struct ContainerCgroup<'a> {
    pub driver: CgroupDriver,
    pub flavor: RuntimeFlavor,
    pub pod_uid: &'a str,
    pub qos: QosClass,
    pub container_id: &'a str,
}

impl ContainerCgroup<'_> {
    /// Candidate paths relative to the memory controller root, most
    /// recent convention first.
    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        match self.driver {
            CgroupDriver::Cgroupfs => {
                let mut path = PathBuf::from("kubepods");
                if let Some(qos) = self.qos.segment() {
                    path.push(qos);
                }
                path.push(format!("{POD_CGROUP_PREFIX}{}", self.pod_uid));
                path.push(self.container_id);
                vec![path]
            }
            CgroupDriver::Systemd => {
                let slice_path = self.systemd_slice_path();
                let pod_slice = self.systemd_pod_slice();
                let scoped = format!(
                    "{}/{}-{}.scope",
                    slice_path,
                    self.flavor.scope_prefix(),
                    self.container_id
                );
                match self.flavor {
                    RuntimeFlavor::Containerd => vec![
                        PathBuf::from(format!(
                            "system.slice/containerd.service/{pod_slice}:{}:{}",
                            self.flavor.scope_prefix(),
                            self.container_id
                        )),
                        PathBuf::from(scoped),
                    ],
                    RuntimeFlavor::Docker => vec![
                        PathBuf::from(format!("{slice_path}/{}", self.container_id)),
                        PathBuf::from(scoped),
                    ],
                }
            }
        }
    }

    /// `kubepods.slice/kubepods-<qos>.slice/<pod slice>`.
    fn systemd_slice_path(&self) -> String {
        let pod_slice = self.systemd_pod_slice();
        match self.qos.segment() {
            Some(qos) => format!("kubepods.slice/kubepods-{qos}.slice/{pod_slice}"),
            None => format!("kubepods.slice/{pod_slice}"),
        }
    }

    /// The leaf slice name; systemd forbids dashes inside a unit name
    /// component, so the uid's are flattened to underscores.
    fn systemd_pod_slice(&self) -> String {
        let uid = self.pod_uid.replace('-', "_");
        match self.qos.segment() {
            Some(qos) => format!("kubepods-{qos}-{POD_CGROUP_PREFIX}{uid}.slice"),
            None => format!("kubepods-{POD_CGROUP_PREFIX}{uid}.slice"),
        }
    }

    /// Picks the first candidate that exists under `root`.
    pub fn resolve(&self, root: &Path) -> Result<PathBuf, Error> {
        let candidates = self.candidate_paths();
        for candidate in &candidates {
            let absolute = root.join(candidate);
            if absolute.exists() {
                return Ok(absolute);
            }
        }
        Err(make_err!(
            Code::NotFound,
            "no memory cgroup for container {} (tried {:?})",
            self.container_id,
            candidates
        ))
    }
}

/// Collects every pid below the container's memory cgroup by reading
/// all `cgroup.procs` files recursively.
pub fn pids_under(base: &Path) -> Result<Vec<i32>, Error> {
    let mut pids = Vec::new();
    for entry in WalkDir::new(base) {
        let entry = entry
            .map_err(|err| make_err!(Code::Internal, "{err}"))
            .err_tip(|| format!("while walking {}", base.display()))?;
        if entry.file_type().is_dir() || entry.file_name() != CGROUP_PROCS {
            continue;
        }
        let contents = std::fs::read_to_string(entry.path())
            .map_err(Error::from)
            .err_tip(|| format!("while reading {}", entry.path().display()))?;
        for line in contents.lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                pids.push(pid);
            }
        }
    }
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

/// Recovers `(pod uid, container id)` from the memory line of
/// `/proc/self/cgroup`, e.g.
///
/// ```text
/// 10:memory:/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-podd98c..slice/cri-containerd-8134e..fa21.scope
/// ```
pub fn extract_ids_from_memory_line(line: &str) -> (Option<String>, Option<String>) {
    let is_systemd = line.contains(".slice");
    let flattened = line.replace(':', "/");
    let segments: Vec<&str> = flattened.trim().split('/').collect();

    let mut pod_uid = None;
    let mut container_id = None;
    for (position, segment) in segments.iter().enumerate() {
        if position == segments.len() - 1 {
            let mut id = segment.trim().trim_end_matches(".scope");
            if let Some(dash) = id.rfind('-') {
                id = &id[dash + 1..];
            }
            if !id.is_empty() {
                container_id = Some(id.to_string());
            }
        } else if is_systemd {
            if let Some(index) = segment.find("-pod") {
                let candidate = segment[index + 4..].trim_end_matches(".slice");
                if candidate.len() == UID_LEN {
                    pod_uid = Some(candidate.replace('_', "-"));
                }
            }
        } else if let Some(candidate) = segment.strip_prefix(POD_CGROUP_PREFIX) {
            if candidate.len() == UID_LEN {
                pod_uid = Some(candidate.to_string());
            }
        }
    }
    (pod_uid, container_id)
}

/// Finds the memory controller line in `/proc/self/cgroup` content.
pub fn memory_line(cgroup_file: &str) -> Option<&str> {
    cgroup_file.lines().find(|line| {
        line.splitn(3, ':')
            .nth(1)
            .is_some_and(|controllers| controllers.split(',').any(|c| c == "memory"))
    })
}
