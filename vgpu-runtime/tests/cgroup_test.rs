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

use pretty_assertions::assert_eq;
use vgpu_config::CgroupDriver;
use vgpu_runtime::cgroup::{
    extract_ids_from_memory_line, memory_line, pids_under, ContainerCgroup, QosClass,
    RuntimeFlavor,
};

const POD_UID: &str = "d98c80af-2009-4eef-9311-71beb2a1a577";
const CONTAINER_ID: &str = "8134e620c37afff34535d04db616284d8b14d659ef5a9fd3f5f6f12988bdfa21";

fn cgroup(driver: CgroupDriver, flavor: RuntimeFlavor, qos: QosClass) -> ContainerCgroup<'static> {
    ContainerCgroup {
        driver,
        flavor,
        pod_uid: POD_UID,
        qos,
        container_id: CONTAINER_ID,
    }
}

#[test]
fn cgroupfs_path_is_single_candidate() {
    let candidates = cgroup(
        CgroupDriver::Cgroupfs,
        RuntimeFlavor::Docker,
        QosClass::BestEffort,
    )
    .candidate_paths();
    assert_eq!(
        candidates
            .iter()
            .map(|p| p.to_str().unwrap())
            .collect::<Vec<_>>(),
        vec![format!("kubepods/besteffort/pod{POD_UID}/{CONTAINER_ID}").as_str()],
    );
}

#[test]
fn cgroupfs_guaranteed_skips_qos_segment() {
    let candidates = cgroup(
        CgroupDriver::Cgroupfs,
        RuntimeFlavor::Docker,
        QosClass::Guaranteed,
    )
    .candidate_paths();
    assert_eq!(
        candidates[0].to_str().unwrap(),
        format!("kubepods/pod{POD_UID}/{CONTAINER_ID}")
    );
}

#[test]
fn systemd_docker_candidates_new_then_old() {
    let candidates = cgroup(
        CgroupDriver::Systemd,
        RuntimeFlavor::Docker,
        QosClass::BestEffort,
    )
    .candidate_paths();
    let uid = POD_UID.replace('-', "_");
    let slice =
        format!("kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{uid}.slice");
    assert_eq!(
        candidates
            .iter()
            .map(|p| p.to_str().unwrap().to_string())
            .collect::<Vec<_>>(),
        vec![
            format!("{slice}/{CONTAINER_ID}"),
            format!("{slice}/docker-{CONTAINER_ID}.scope"),
        ],
    );
}

#[test]
fn systemd_containerd_candidates_new_then_old() {
    let candidates = cgroup(
        CgroupDriver::Systemd,
        RuntimeFlavor::Containerd,
        QosClass::Burstable,
    )
    .candidate_paths();
    let uid = POD_UID.replace('-', "_");
    let pod_slice = format!("kubepods-burstable-pod{uid}.slice");
    assert_eq!(
        candidates
            .iter()
            .map(|p| p.to_str().unwrap().to_string())
            .collect::<Vec<_>>(),
        vec![
            format!("system.slice/containerd.service/{pod_slice}:cri-containerd:{CONTAINER_ID}"),
            format!(
                "kubepods.slice/kubepods-burstable.slice/{pod_slice}/cri-containerd-{CONTAINER_ID}.scope"
            ),
        ],
    );
}

#[test]
fn resolve_prefers_the_first_existing_candidate() {
    let root = tempfile::tempdir().unwrap();
    let spec = cgroup(
        CgroupDriver::Systemd,
        RuntimeFlavor::Docker,
        QosClass::BestEffort,
    );
    // Only the old convention exists on this host.
    let old = root.path().join(&spec.candidate_paths()[1]);
    std::fs::create_dir_all(&old).unwrap();

    let resolved = spec.resolve(root.path()).unwrap();
    assert_eq!(resolved, old);

    // Once the new convention appears it wins.
    let new = root.path().join(&spec.candidate_paths()[0]);
    std::fs::create_dir_all(&new).unwrap();
    assert_eq!(spec.resolve(root.path()).unwrap(), new);
}

#[test]
fn resolve_fails_when_no_candidate_exists() {
    let root = tempfile::tempdir().unwrap();
    let spec = cgroup(
        CgroupDriver::Systemd,
        RuntimeFlavor::Containerd,
        QosClass::BestEffort,
    );
    assert!(spec.resolve(root.path()).is_err());
}

#[test]
fn pids_are_collected_recursively_and_deduplicated() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("nested/deeper")).unwrap();
    std::fs::write(root.path().join("cgroup.procs"), "12\n34\n").unwrap();
    std::fs::write(root.path().join("nested/cgroup.procs"), "34\n56\n").unwrap();
    std::fs::write(
        root.path().join("nested/deeper/cgroup.procs"),
        "78\nnot-a-pid\n",
    )
    .unwrap();

    let pids = pids_under(root.path()).unwrap();
    assert_eq!(pids, vec![12, 34, 56, 78]);
}

#[test]
fn extracts_ids_from_systemd_containerd_scope_line() {
    let line = format!(
        "10:memory:/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{}.slice/cri-containerd-{CONTAINER_ID}.scope",
        POD_UID.replace('-', "_"),
    );
    let (pod_uid, container_id) = extract_ids_from_memory_line(&line);
    assert_eq!(pod_uid.as_deref(), Some(POD_UID));
    assert_eq!(container_id.as_deref(), Some(CONTAINER_ID));
}

#[test]
fn extracts_ids_from_containerd_service_line() {
    let line = format!(
        "5:memory:/system.slice/containerd.service/kubepods-besteffort-pod{}.slice:cri-containerd:{CONTAINER_ID}",
        POD_UID.replace('-', "_"),
    );
    let (pod_uid, container_id) = extract_ids_from_memory_line(&line);
    assert_eq!(pod_uid.as_deref(), Some(POD_UID));
    assert_eq!(container_id.as_deref(), Some(CONTAINER_ID));
}

#[test]
fn extracts_ids_from_cgroupfs_line() {
    let line = format!("11:memory:/kubepods/besteffort/pod{POD_UID}/{CONTAINER_ID}");
    let (pod_uid, container_id) = extract_ids_from_memory_line(&line);
    assert_eq!(pod_uid.as_deref(), Some(POD_UID));
    assert_eq!(container_id.as_deref(), Some(CONTAINER_ID));
}

#[test]
fn extracts_ids_from_docker_slice_line() {
    let line = format!(
        "10:memory:/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{}.slice/docker-{CONTAINER_ID}.scope",
        POD_UID.replace('-', "_"),
    );
    let (pod_uid, container_id) = extract_ids_from_memory_line(&line);
    assert_eq!(pod_uid.as_deref(), Some(POD_UID));
    assert_eq!(container_id.as_deref(), Some(CONTAINER_ID));
}

#[test]
fn memory_line_finds_the_memory_controller() {
    let contents = "\
12:cpuset:/\n\
10:memory:/kubepods/pod123/abc\n\
3:cpu,cpuacct:/\n";
    assert_eq!(
        memory_line(contents),
        Some("10:memory:/kubepods/pod123/abc")
    );
    assert_eq!(memory_line("3:cpu:/"), None);
}
