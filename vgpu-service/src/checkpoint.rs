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

//! Reservation checkpoint in the kubelet's own schema. The reader copes
//! with every historical layout (NUMA-keyed device ids, wrapped flat,
//! bare flat); the writer always emits the wrapped flat form.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vgpu_error::{Code, Error, ResultExt};

/// Serde adapter matching Go's `[]byte` JSON encoding.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            None => Ok(Vec::new()),
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDevicesEntry {
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    #[serde(rename = "ContainerName")]
    pub container_name: String,
    #[serde(rename = "ResourceName")]
    pub resource_name: String,
    #[serde(rename = "DeviceIDs")]
    pub device_ids: Vec<String>,
    #[serde(rename = "AllocResp", with = "base64_bytes")]
    pub alloc_resp: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
struct PodDevicesEntryNuma {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    #[serde(rename = "ContainerName")]
    container_name: String,
    #[serde(rename = "ResourceName")]
    resource_name: String,
    /// Device ids grouped by NUMA node.
    #[serde(rename = "DeviceIDs")]
    device_ids: BTreeMap<String, Vec<String>>,
    #[serde(rename = "AllocResp", with = "base64_bytes")]
    alloc_resp: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "PodDeviceEntries")]
    pub pod_device_entries: Vec<PodDevicesEntry>,
    #[serde(rename = "RegisteredDevices")]
    pub registered_devices: HashMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointData {
    #[serde(rename = "Data")]
    data: Checkpoint,
}

#[derive(Debug, Deserialize)]
struct CheckpointNuma {
    #[serde(rename = "PodDeviceEntries")]
    pod_device_entries: Vec<PodDevicesEntryNuma>,
    #[serde(rename = "RegisteredDevices")]
    registered_devices: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CheckpointDataNuma {
    #[serde(rename = "Data")]
    data: CheckpointNuma,
}

impl From<CheckpointNuma> for Checkpoint {
    fn from(numa: CheckpointNuma) -> Self {
        Self {
            pod_device_entries: numa
                .pod_device_entries
                .into_iter()
                .map(|entry| PodDevicesEntry {
                    pod_uid: entry.pod_uid,
                    container_name: entry.container_name,
                    resource_name: entry.resource_name,
                    // Merge the NUMA groups, keyed order for determinism.
                    device_ids: entry.device_ids.into_values().flatten().collect(),
                    alloc_resp: entry.alloc_resp,
                })
                .collect(),
            registered_devices: numa.registered_devices,
        }
    }
}

/// Parses any accepted checkpoint layout.
pub fn parse(raw: &[u8]) -> Result<Checkpoint, Error> {
    if let Ok(numa) = serde_json::from_slice::<CheckpointDataNuma>(raw) {
        debug!("checkpoint parsed in NUMA layout");
        return Ok(numa.data.into());
    }
    if let Ok(wrapped) = serde_json::from_slice::<CheckpointData>(raw) {
        return Ok(wrapped.data);
    }
    serde_json::from_slice::<Checkpoint>(raw)
        .map_err(Error::from)
        .err_tip_with_code(|_| (Code::Internal, "checkpoint is not parseable in any known layout"))
}

/// Owns the checkpoint file. Writes go through a temp file in the same
/// directory, are synced, then renamed over the previous generation.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Loads the current checkpoint; `None` when none was written yet.
    pub fn load(&self) -> Result<Option<Checkpoint>, Error> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::from(err))
                    .err_tip(|| format!("while reading checkpoint {}", self.path.display()))
            }
        };
        parse(&raw).map(Some)
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        let directory = self
            .path
            .parent()
            .err_tip(|| "checkpoint path has no parent directory")?;
        std::fs::create_dir_all(directory)
            .map_err(Error::from)
            .err_tip(|| format!("while creating {}", directory.display()))?;

        let serialized = serde_json::to_vec(&CheckpointData {
            data: checkpoint.clone(),
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(directory)
            .map_err(Error::from)
            .err_tip(|| "while creating checkpoint temp file")?;
        temp.write_all(&serialized)
            .map_err(Error::from)
            .err_tip(|| "while writing checkpoint temp file")?;
        temp.as_file()
            .sync_all()
            .map_err(Error::from)
            .err_tip(|| "while syncing checkpoint temp file")?;
        temp.persist(&self.path)
            .map_err(|err| Error::from(err.error))
            .err_tip(|| format!("while renaming checkpoint into {}", self.path.display()))?;
        Ok(())
    }
}
