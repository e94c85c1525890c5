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

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use vgpu_service::checkpoint::{parse, Checkpoint, CheckpointStore, PodDevicesEntry};

fn sample_checkpoint() -> Checkpoint {
    Checkpoint {
        pod_device_entries: vec![
            PodDevicesEntry {
                pod_uid: "pod-a".to_string(),
                container_name: "main".to_string(),
                resource_name: "nvidia.com/vcuda-core".to_string(),
                device_ids: vec!["core-0".to_string(), "core-1".to_string()],
                alloc_resp: vec![0x0a, 0x03, 0x66, 0x6f, 0x6f],
            },
            PodDevicesEntry {
                pod_uid: "pod-a".to_string(),
                container_name: "main".to_string(),
                resource_name: "nvidia.com/vcuda-memory".to_string(),
                device_ids: vec!["memory-0".to_string()],
                alloc_resp: Vec::new(),
            },
        ],
        registered_devices: HashMap::from([(
            "nvidia.com/vcuda-core".to_string(),
            vec!["core-0".to_string(), "core-1".to_string()],
        )]),
    }
}

#[test]
fn write_then_parse_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("kubelet_internal_checkpoint"));
    assert_eq!(store.load().unwrap(), None);

    let checkpoint = sample_checkpoint();
    store.save(&checkpoint).unwrap();
    assert_eq!(store.load().unwrap(), Some(checkpoint));
}

#[test]
fn alloc_resp_is_base64_in_the_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("kubelet_internal_checkpoint"));
    store.save(&sample_checkpoint()).unwrap();

    let raw = std::fs::read_to_string(store.path()).unwrap();
    // base64("\x0a\x03foo")
    assert!(raw.contains("CgNmb28="), "raw json: {raw}");
    assert!(raw.contains("\"Data\""));
}

#[test]
fn parses_the_bare_flat_layout() {
    let raw = r#"{
        "PodDeviceEntries": [{
            "PodUID": "pod-a",
            "ContainerName": "main",
            "ResourceName": "nvidia.com/vcuda-core",
            "DeviceIDs": ["core-7"],
            "AllocResp": "CgNmb28="
        }],
        "RegisteredDevices": {"nvidia.com/vcuda-core": ["core-7"]}
    }"#;
    let checkpoint = parse(raw.as_bytes()).unwrap();
    assert_eq!(checkpoint.pod_device_entries.len(), 1);
    assert_eq!(checkpoint.pod_device_entries[0].device_ids, vec!["core-7"]);
    assert_eq!(
        checkpoint.pod_device_entries[0].alloc_resp,
        vec![0x0a, 0x03, 0x66, 0x6f, 0x6f]
    );
}

#[test]
fn parses_the_numa_layout_and_merges_groups() {
    let raw = r#"{
        "Data": {
            "PodDeviceEntries": [{
                "PodUID": "pod-a",
                "ContainerName": "main",
                "ResourceName": "nvidia.com/vcuda-core",
                "DeviceIDs": {"0": ["core-0", "core-1"], "1": ["core-9"]},
                "AllocResp": ""
            }],
            "RegisteredDevices": {}
        }
    }"#;
    let checkpoint = parse(raw.as_bytes()).unwrap();
    assert_eq!(
        checkpoint.pod_device_entries[0].device_ids,
        vec!["core-0", "core-1", "core-9"]
    );
}

#[test]
fn parses_the_wrapped_flat_layout() {
    let raw = r#"{
        "Data": {
            "PodDeviceEntries": [],
            "RegisteredDevices": {"nvidia.com/vcuda-memory": ["memory-0"]}
        }
    }"#;
    let checkpoint = parse(raw.as_bytes()).unwrap();
    assert!(checkpoint.pod_device_entries.is_empty());
    assert_eq!(checkpoint.registered_devices.len(), 1);
}

#[test]
fn garbage_is_an_error() {
    assert!(parse(b"not json at all").is_err());
    assert!(parse(b"{\"SomethingElse\": 1}").is_err());
}

#[test]
fn save_replaces_the_previous_generation_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("kubelet_internal_checkpoint"));
    store.save(&sample_checkpoint()).unwrap();

    let mut second = sample_checkpoint();
    second.pod_device_entries.clear();
    store.save(&second).unwrap();

    assert_eq!(store.load().unwrap(), Some(second));
    // No temp files left behind.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "kubelet_internal_checkpoint")
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
}
