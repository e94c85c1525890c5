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

use core::time::Duration;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use notify::Watcher as _;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use vgpu_config::{parse_node_labels, CgroupDriver, Config};
use vgpu_error::{Code, Error, ResultExt, make_err};
use vgpu_proto::deviceplugin::v1beta1::{DEVICE_PLUGIN_PATH, KUBELET_SOCKET};
use vgpu_runtime::CriRuntime;
use vgpu_service::allocator::{Allocator, VDeviceEvent};
use vgpu_service::annotation::NodeAnnotator;
use vgpu_service::checkpoint::CheckpointStore;
use vgpu_service::label::NodeLabeler;
use vgpu_service::plugin::{register_with_kubelet, serve_plugin, DevicePluginService, ResourceKind};
use vgpu_service::response::ResponseCache;
use vgpu_service::virtual_manager::VirtualManager;
use vgpu_service::watchdog::PodCache;
use vgpu_topology::probe::{DeviceProbe, UnavailableProbe};
use vgpu_topology::tree::GpuTree;

const DEFAULT_KUBELET_CONFIG: &str = "/var/lib/kubelet/config.yaml";

/// Node-local GPU partitioning daemon: advertises vcuda-core and
/// vcuda-memory to the kubelet, places reservations on physical cards
/// and installs per-container quota files.
#[derive(Parser, Debug)]
#[clap(author, version)]
struct Options {
    /// The device driver this daemon manages.
    #[clap(long, default_value = "nvidia")]
    driver: String,

    /// Directory for per-pod state and registration sockets.
    #[clap(long, default_value = "/etc/vgpu-manager/vm")]
    virtual_manager_path: PathBuf,

    /// The kubelet's device-plugin directory.
    #[clap(long, default_value = DEVICE_PLUGIN_PATH)]
    device_plugin_path: PathBuf,

    /// Directory for the reservation checkpoint.
    #[clap(long, default_value = "/etc/vgpu-manager/checkpoint")]
    checkpoint_path: PathBuf,

    /// Unix socket of the CRI runtime.
    #[clap(long, default_value = "/var/run/containerd/containerd.sock")]
    container_runtime_endpoint: PathBuf,

    /// cgroupfs or systemd; detected from the kubelet config when unset.
    #[clap(long)]
    cgroup_driver: Option<String>,

    /// Fraction of device memory advertised to the cluster (0, 1].
    #[clap(long, default_value_t = 1.0)]
    device_memory_scaling: f64,

    /// Per-card sampling window in seconds.
    #[clap(long, default_value_t = 1)]
    sample_period: u64,

    /// Seconds between reservation liveness sweeps.
    #[clap(long, default_value_t = 30)]
    allocation_check_period: u64,

    /// Deadline in seconds for outbound RPCs.
    #[clap(long, default_value_t = 5)]
    request_timeout: u64,

    /// Seconds to wait for internal services before giving up.
    #[clap(long, default_value_t = 60)]
    wait_timeout: u64,

    /// Accept fractional (shared) allocations.
    #[clap(long = "share-mode")]
    share_mode: bool,

    /// Extra node labels, `key=value` comma separated.
    #[clap(long, default_value = "")]
    node_labels: String,

    /// Host directory holding the in-container runtime library.
    #[clap(long, default_value = "/usr/local/vgpu")]
    driver_library_path: PathBuf,

    /// Textual topology matrix used when the device probe is absent.
    #[clap(long)]
    topology_file: Option<PathBuf>,

    /// Out-of-cluster kubeconfig; in-cluster config is used when unset.
    #[clap(long)]
    kubeconfig: Option<PathBuf>,

    /// Per-node overrides file.
    #[clap(long, default_value = "/etc/vgpu-manager/config/config.json")]
    node_config: PathBuf,

    /// Identity of this node, NODE_NAME by default.
    #[clap(long, env = "NODE_NAME", default_value = "")]
    hostname_override: String,
}

impl Options {
    fn into_config(self) -> Result<(Config, PathBuf), Error> {
        let cgroup_driver = match &self.cgroup_driver {
            Some(raw) => raw.parse()?,
            None => detect_cgroup_driver()?,
        };
        let config = Config {
            driver: self.driver,
            node_name: self.hostname_override,
            virtual_manager_path: self.virtual_manager_path,
            device_plugin_path: self.device_plugin_path,
            checkpoint_path: self.checkpoint_path,
            container_runtime_endpoint: self.container_runtime_endpoint,
            cgroup_driver,
            device_memory_scaling: self.device_memory_scaling,
            sample_period: Duration::from_secs(self.sample_period),
            allocation_check_period: Duration::from_secs(self.allocation_check_period),
            request_timeout: Duration::from_secs(self.request_timeout),
            wait_timeout: Duration::from_secs(self.wait_timeout),
            enable_share: self.share_mode,
            node_labels: parse_node_labels(&self.node_labels)?,
            driver_library_path: self.driver_library_path,
            topology_file: self.topology_file,
            kubeconfig: self.kubeconfig,
        };
        Ok((config, self.node_config))
    }
}

/// Reads the cgroup driver out of the kubelet's own config file.
fn detect_cgroup_driver() -> Result<CgroupDriver, Error> {
    let raw = std::fs::read_to_string(DEFAULT_KUBELET_CONFIG)
        .map_err(Error::from)
        .err_tip(|| format!("while detecting cgroup driver from {DEFAULT_KUBELET_CONFIG}"))?;
    for line in raw.lines() {
        if let Some(value) = line.trim().strip_prefix("cgroupDriver:") {
            return value.trim().parse();
        }
    }
    Err(make_err!(
        Code::NotFound,
        "no cgroupDriver in {DEFAULT_KUBELET_CONFIG}, pass --cgroup-driver"
    ))
}

async fn kube_client(config: &Config) -> Result<kube::Client, Error> {
    let client_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .map_err(|err| make_err!(Code::InvalidArgument, "bad kubeconfig: {err}"))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                .await
                .map_err(|err| make_err!(Code::InvalidArgument, "bad kubeconfig: {err}"))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|err| make_err!(Code::Unavailable, "no cluster configuration: {err}"))?,
    };
    kube::Client::try_from(client_config)
        .map_err(|err| make_err!(Code::Unavailable, "can't build cluster client: {err}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(err) = run().await {
        error!(?err, "daemon failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let (mut config, node_config_path) = Options::parse().into_config()?;
    config.apply_node_overrides(&node_config_path)?;
    config.validate()?;
    let config = Arc::new(config);
    info!(node = config.node_name, "starting gpu manager");

    // The vendor management library is an external port; without one the
    // tree runs on the textual topology and stays passive.
    let probe: Arc<dyn DeviceProbe> = Arc::new(UnavailableProbe);
    let matrix = match &config.topology_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .map_err(Error::from)
                .err_tip(|| format!("while reading topology file {}", path.display()))?,
        ),
        None => None,
    };
    let tree = GpuTree::init(probe.clone(), matrix.as_deref(), config.sample_period)?;
    info!("\n{}", tree.print_graph());
    let driver_version = tree.driver_version();
    let tree = Arc::new(Mutex::new(tree));

    let client = kube_client(&config).await?;
    let pods = Arc::new(PodCache::start(client.clone(), &config.node_name).await?);

    let cache = Arc::new(ResponseCache::new());
    let checkpoint = CheckpointStore::new(config.checkpoint_file());
    let (vdevice_tx, vdevice_rx) = mpsc::channel::<VDeviceEvent>(16);
    let allocator = Arc::new(Allocator::new(
        config.clone(),
        tree.clone(),
        cache.clone(),
        checkpoint,
        pods.clone(),
        vdevice_tx,
    ));
    // A checkpoint we cannot replay means our bookkeeping and the
    // kubelet's no longer agree; serving would double-allocate devices.
    allocator
        .recover()
        .await
        .err_tip(|| "checkpoint recovery failed, refusing to serve")?;

    let runtime = Arc::new(
        CriRuntime::connect(
            &config.container_runtime_endpoint,
            config.cgroup_driver,
            config.request_timeout,
        )
        .await?,
    );
    let virtual_manager = VirtualManager::new(
        config.clone(),
        runtime,
        cache.clone(),
        pods.clone(),
        driver_version,
    );
    tokio::spawn({
        let virtual_manager = Arc::clone(&virtual_manager);
        async move {
            if let Err(err) = virtual_manager.run(vdevice_rx).await {
                error!(?err, "virtual manager failed");
                std::process::exit(1);
            }
        }
    });

    tokio::spawn(Arc::clone(&allocator).run_reclaimer());
    tokio::spawn({
        let tree = tree.clone();
        let period = config.sample_period;
        async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                tree.lock().await.update();
            }
        }
    });

    for kind in [ResourceKind::Core, ResourceKind::Memory] {
        let service = DevicePluginService::new(
            kind,
            config.clone(),
            tree.clone(),
            probe.clone(),
            allocator.clone(),
        );
        let _server = serve_plugin(service, config.device_plugin_path.join(kind.endpoint())).await?;
    }
    // Give the endpoints a beat to accept before announcing them.
    tokio::time::sleep(Duration::from_secs(1)).await;
    for kind in [ResourceKind::Core, ResourceKind::Memory] {
        register_with_kubelet(&config, kind).await?;
    }

    let labeler = NodeLabeler::new(client.clone(), &config.node_name, config.node_labels.clone());
    if let Err(err) = labeler.run(&tree).await {
        warn!(?err, "node labeling failed");
    }
    tokio::spawn(NodeAnnotator::new(client, config.clone(), tree, probe).run());

    watch_kubelet_socket(&config).await
}

/// Blocks until the kubelet recreates its registration socket, which
/// invalidates every registered plugin. Exiting lets the supervisor
/// restart the daemon into a clean re-registration.
async fn watch_kubelet_socket(config: &Config) -> Result<(), Error> {
    let kubelet_socket = config.device_plugin_path.join(KUBELET_SOCKET);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })
    .map_err(|err| make_err!(Code::Internal, "can't create fs watcher: {err}"))?;
    watcher
        .watch(&config.device_plugin_path, notify::RecursiveMode::NonRecursive)
        .map_err(|err| {
            make_err!(
                Code::Internal,
                "can't watch {}: {err}",
                config.device_plugin_path.display()
            )
        })?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            }
            event = event_rx.recv() => {
                let event = event
                    .err_tip(|| "fs watcher channel closed")?
                    .map_err(|err| make_err!(Code::Internal, "fs watch error: {err}"))?;
                if matches!(event.kind, notify::EventKind::Create(_))
                    && event.paths.iter().any(|path| path == &kubelet_socket)
                {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    return Err(make_err!(
                        Code::Aborted,
                        "{} was recreated, restarting to re-register",
                        kubelet_socket.display()
                    ));
                }
            }
        }
    }
}
