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

//! In-memory index of granted allocations, `pod uid -> container name ->
//! reservation`. Mirrored into the checkpoint after every change so a
//! daemon restart can rebuild it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use vgpu_config::well_known::VCUDA_MOUNTPOINT;
use vgpu_error::Error;
use vgpu_proto::deviceplugin::v1beta1::ContainerAllocateResponse;

/// One granted reservation for a (pod, container) pair.
#[derive(Debug, Clone)]
pub struct CachedAllocation {
    /// `/dev/nvidia<minor>` per chosen leaf.
    pub devices: Vec<String>,
    /// Synthetic `vcuda-core` ids the kubelet handed to `Allocate`.
    pub core_ids: Vec<String>,
    pub cores: i64,
    /// Bytes.
    pub memory: i64,
    /// The response returned to the kubelet, kept verbatim so restart
    /// recovery and the virtual manager see exactly what the container
    /// was started with.
    pub response: ContainerAllocateResponse,
    pub created_at: SystemTime,
}

impl CachedAllocation {
    /// Host directory mounted at the well-known in-container path.
    pub fn vcuda_mount_path(&self) -> Option<&str> {
        self.response
            .mounts
            .iter()
            .find(|mount| mount.container_path == VCUDA_MOUNTPOINT)
            .map(|mount| mount.host_path.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    inner: Mutex<HashMap<String, HashMap<String, CachedAllocation>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        pod_uid: &str,
        container_name: &str,
        allocation: CachedAllocation,
    ) -> Result<(), Error> {
        self.inner
            .lock()?
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), allocation);
        Ok(())
    }

    pub fn get(
        &self,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<Option<CachedAllocation>, Error> {
        Ok(self
            .inner
            .lock()?
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name))
            .cloned())
    }

    pub fn contains(&self, pod_uid: &str, container_name: &str) -> Result<bool, Error> {
        Ok(self
            .inner
            .lock()?
            .get(pod_uid)
            .is_some_and(|containers| containers.contains_key(container_name)))
    }

    pub fn delete(&self, pod_uid: &str, container_name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock()?;
        if let Some(containers) = inner.get_mut(pod_uid) {
            containers.remove(container_name);
            if containers.is_empty() {
                inner.remove(pod_uid);
            }
        }
        Ok(())
    }

    pub fn delete_pod(&self, pod_uid: &str) -> Result<(), Error> {
        self.inner.lock()?.remove(pod_uid);
        Ok(())
    }

    /// Snapshot of the whole cache.
    pub fn list_all(&self) -> Result<HashMap<String, HashMap<String, CachedAllocation>>, Error> {
        Ok(self.inner.lock()?.clone())
    }
}
