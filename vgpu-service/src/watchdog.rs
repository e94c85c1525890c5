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

//! Shared cache of this node's pods, filtered down to the ones that can
//! hold GPU reservations.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt as _;
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod};
use kube::api::Api;
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt as _};
use tracing::{info, warn};
use vgpu_config::well_known::{
    BIND_TIME_LABEL, HUNDRED_CORE, PRE_START_CHECK_ERR_MSG, UNEXPECTED_ADMISSION_ERR_TYPE,
    VCORE_RESOURCE, VMEMORY_RESOURCE,
};
use vgpu_error::{make_err, Code, Error, ResultExt};
use vgpu_runtime::cgroup::QosClass;

/// What the allocator and the virtual manager need to know about pods.
/// The production implementation is [`PodCache`]; tests substitute a
/// fixed map.
pub trait PodSource: Send + Sync {
    fn active_pods(&self) -> HashMap<String, Arc<Pod>>;

    fn pod(&self, namespace: &str, name: &str) -> Result<Arc<Pod>, Error>;
}

/// Watches pods bound to this node through a field-selected reflector.
#[derive(Clone)]
pub struct PodCache {
    store: Store<Pod>,
}

impl PodCache {
    /// Starts the reflector and waits for the first sync.
    pub async fn start(client: kube::Client, node_name: &str) -> Result<Self, Error> {
        let pods: Api<Pod> = Api::all(client);
        let config =
            watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
        let (store, writer) = reflector::store();

        let mut stream = Box::pin(
            watcher(pods, config)
                .default_backoff()
                .reflect(writer)
                .applied_objects(),
        );
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Err(err) = event {
                    warn!(?err, "pod watch interrupted");
                }
            }
        });

        store
            .wait_until_ready()
            .await
            .map_err(|err| make_err!(Code::Unavailable, "pod cache never synced: {err}"))?;
        info!(node_name, "pod cache is running");
        Ok(Self { store })
    }

}

impl PodSource for PodCache {
    /// Pods that can legitimately hold a reservation right now: not
    /// terminated, requesting GPU resources.
    fn active_pods(&self) -> HashMap<String, Arc<Pod>> {
        self.store
            .state()
            .into_iter()
            .filter(|pod| !pod_is_terminated(pod) && is_gpu_required_pod(pod))
            .filter_map(|pod| {
                pod.metadata
                    .uid
                    .clone()
                    .map(|uid| (uid, pod))
            })
            .collect()
    }

    /// Same filter as [`PodSource::active_pods`], addressed by name.
    fn pod(&self, namespace: &str, name: &str) -> Result<Arc<Pod>, Error> {
        let pod = self
            .store
            .state()
            .into_iter()
            .find(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod.metadata.name.as_deref() == Some(name)
            })
            .err_tip_with_code(|_| (Code::NotFound, format!("no pod {namespace}/{name}")))?;
        vgpu_error::error_if!(pod_is_terminated(&pod), "pod {namespace}/{name} terminated");
        vgpu_error::error_if!(
            !is_gpu_required_pod(&pod),
            "pod {namespace}/{name} requests no GPU"
        );
        Ok(pod)
    }
}

/// Failed/Succeeded pods are gone; deleted pods count as gone once no
/// container is running anymore.
pub fn pod_is_terminated(pod: &Pod) -> bool {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Failed") | Some("Succeeded")) {
        return true;
    }
    pod.metadata.deletion_timestamp.is_some()
        && not_running(
            status
                .and_then(|s| s.container_statuses.as_deref())
                .unwrap_or_default(),
        )
}

fn not_running(statuses: &[ContainerStatus]) -> bool {
    statuses.iter().all(|status| {
        status
            .state
            .as_ref()
            .map_or(true, |state| state.terminated.is_some() || state.waiting.is_some())
    })
}

/// A pod needs the daemon when it asks for shares, and for fractional
/// requests also a memory quota.
pub fn is_gpu_required_pod(pod: &Pod) -> bool {
    let cores: i64 = pod_resource_limit(pod, VCORE_RESOURCE);
    let memory: i64 = pod_resource_limit(pod, VMEMORY_RESOURCE);
    cores > 0 && (cores >= HUNDRED_CORE || memory > 0)
}

pub fn is_gpu_required_container(container: &Container) -> bool {
    let cores = container_resource_limit(container, VCORE_RESOURCE);
    let memory = container_resource_limit(container, VMEMORY_RESOURCE);
    cores > 0 && (cores >= HUNDRED_CORE || memory > 0)
}

/// The kubelet rejected or evicted the pod before start; its
/// reservation must be dropped even though the object still exists.
pub fn pod_was_rejected(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.reason.as_deref() == Some(UNEXPECTED_ADMISSION_ERR_TYPE) {
        return true;
    }
    status
        .container_statuses
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|container| {
            container
                .state
                .as_ref()
                .and_then(|state| state.waiting.as_ref())
                .and_then(|waiting| waiting.message.as_deref())
                .is_some_and(|message| message.contains(PRE_START_CHECK_ERR_MSG))
        })
}

pub fn pod_resource_limit(pod: &Pod, resource: &str) -> i64 {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|container| container_resource_limit(container, resource))
                .sum()
        })
        .unwrap_or(0)
}

pub fn container_resource_limit(container: &Container, resource: &str) -> i64 {
    container
        .resources
        .as_ref()
        .and_then(|resources| resources.limits.as_ref())
        .and_then(|limits| limits.get(resource))
        .and_then(|quantity| quantity.0.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Scheduler bind time, falling back to the creation timestamp so pods
/// without the label still sort consistently.
pub fn bind_time(pod: &Pod) -> u64 {
    if let Some(raw) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(BIND_TIME_LABEL))
    {
        match raw.parse::<u64>() {
            Ok(parsed) => return parsed,
            Err(err) => warn!(raw, ?err, "unparseable bind-time label"),
        }
    }
    pod.metadata
        .creation_timestamp
        .as_ref()
        .and_then(|time| time.0.timestamp_nanos_opt())
        .map(|nanos| nanos as u64)
        .unwrap_or(0)
}

pub fn creation_time(pod: &Pod) -> i64 {
    pod.metadata
        .creation_timestamp
        .as_ref()
        .and_then(|time| time.0.timestamp_nanos_opt())
        .unwrap_or(0)
}

/// The pod's QoS class, which decides its cgroup parent. Falls back to
/// deriving it from the resource spec when the status has not settled.
pub fn qos_class(pod: &Pod) -> QosClass {
    if let Some(qos) = pod
        .status
        .as_ref()
        .and_then(|status| status.qos_class.as_deref())
    {
        if let Ok(parsed) = qos.parse() {
            return parsed;
        }
    }
    derive_qos_class(pod)
}

fn derive_qos_class(pod: &Pod) -> QosClass {
    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();

    let mut any_request = false;
    let mut guaranteed = true;
    for container in containers {
        let resources = container.resources.as_ref();
        let requests = resources.and_then(|r| r.requests.as_ref());
        let limits = resources.and_then(|r| r.limits.as_ref());
        for native in ["cpu", "memory"] {
            let request = requests.and_then(|map| map.get(native));
            let limit = limits.and_then(|map| map.get(native));
            if request.is_some() || limit.is_some() {
                any_request = true;
            }
            if limit.is_none() || (request.is_some() && request != limit) {
                guaranteed = false;
            }
        }
    }

    if !any_request {
        QosClass::BestEffort
    } else if guaranteed {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}
