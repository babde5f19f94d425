//! Reconciles the local dataplane with the cluster's nodes.

use crate::{
    core::{
        dataplane::{Dataplane, FlowClient, PeerMeshClient, RouteClient},
        EncryptionMode, IpNet, NetworkConfig, NodeConfig, NodeView, PeerIdentity,
    },
    index::{
        CidrConflict, InitialListRx, InstalledNodes, NodeRouteInfo, PodSubnets, SharedNodeIndex,
        WorkQueue,
    },
    k8s::{self, InvalidNode},
    metrics::{ControllerMetrics, SyncResult},
    sync::{InitialListTracker, InitialSync},
    tunnel::{TunnelError, TunnelPortManager},
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

/// Drives the dataplane so that every remote node's pod CIDRs are reachable.
///
/// Node names are consumed from a work queue fed by the node index. Each name is reconciled by at
/// most one worker at a time; distinct names are reconciled concurrently.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    node: NodeConfig,
    network: NetworkConfig,
    nodes: SharedNodeIndex,
    queue: WorkQueue<String>,
    installed: Mutex<InstalledNodes>,
    pod_subnets: PodSubnets,
    tunnels: TunnelPortManager,
    flows: Arc<dyn FlowClient>,
    routes: Arc<dyn RouteClient>,
    peer_mesh: Arc<dyn PeerMeshClient>,
    metrics: ControllerMetrics,
    initial_list: InitialListTracker,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("pod CIDR {cidr} is already claimed by node {owner}")]
    Conflict { cidr: IpNet, owner: String },

    #[error("node is not ready: {0}")]
    NotReady(String),

    #[error("invalid node: {0}")]
    InvalidNode(#[from] InvalidNode),
}

// === impl Controller ===

impl Controller {
    pub fn new(
        node: NodeConfig,
        network: NetworkConfig,
        nodes: SharedNodeIndex,
        queue: WorkQueue<String>,
        dataplane: Dataplane,
        metrics: ControllerMetrics,
    ) -> Self {
        let Dataplane {
            flows,
            routes,
            bridge,
            peer_mesh,
            certificates,
        } = dataplane;
        let pod_subnets = PodSubnets::new(&node.pod_cidrs);
        let tunnels =
            TunnelPortManager::new(network.clone(), bridge, peer_mesh.clone(), certificates);
        Self {
            inner: Arc::new(Inner {
                node,
                network,
                nodes,
                queue,
                installed: Mutex::new(InstalledNodes::default()),
                pod_subnets,
                tunnels,
                flows,
                routes,
                peer_mesh,
                metrics,
                initial_list: InitialListTracker::new(),
            }),
        }
    }

    /// Returns a handle on the pod-subnet index, for use on the packet processing path.
    pub fn pod_subnets(&self) -> PodSubnets {
        self.inner.pod_subnets.clone()
    }

    /// Returns a gate that is signaled once every node of the initial listing has been processed.
    pub fn initial_sync(&self) -> InitialSync {
        self.inner.initial_list.subscribe()
    }

    pub(crate) fn network(&self) -> &NetworkConfig {
        &self.inner.network
    }

    pub(crate) fn nodes(&self) -> &SharedNodeIndex {
        &self.inner.nodes
    }

    pub(crate) fn tunnels(&self) -> &TunnelPortManager {
        &self.inner.tunnels
    }

    pub(crate) fn routes(&self) -> &Arc<dyn RouteClient> {
        &self.inner.routes
    }

    pub(crate) fn peer_mesh(&self) -> &Arc<dyn PeerMeshClient> {
        &self.inner.peer_mesh
    }

    /// Runs the controller until `shutdown` is signaled.
    ///
    /// Once the node index has completed its initial listing, stale dataplane state is removed and
    /// `workers` tasks start processing the work queue. In-flight reconciliations complete before
    /// the shutdown is released.
    pub async fn run(self, mut initial_list: InitialListRx, workers: usize, shutdown: drain::Watch) {
        if !self.inner.network.encap_mode.needs_per_node_dataplane() {
            info!(
                mode = %self.inner.network.encap_mode,
                "Node routes are not managed in this mode"
            );
            self.inner.initial_list.signal();
            drop(shutdown.signaled().await);
            return;
        }

        info!("Waiting for the initial node list");
        let listed = tokio::select! {
            biased;
            _ = shutdown.clone().signaled() => None,
            res = initial_list.wait_for(Option::is_some) => res.ok().and_then(|list| list.clone()),
        };
        let Some(names) = listed else {
            info!("Stopped before the initial node list was received");
            return;
        };
        info!(nodes = names.len(), "Received the initial node list");
        self.inner.initial_list.start(&names);

        self.remove_stale_state().await;

        if shutdown.clone().signaled().now_or_never().is_some() {
            info!("Stopped before starting workers");
            return;
        }

        let mut tasks = JoinSet::new();
        for id in 0..workers.max(1) {
            let controller = self.clone();
            tasks.spawn(controller.worker().instrument(info_span!("worker", id)));
        }
        self.inner.initial_list.signal_if_done();

        let release = shutdown.signaled().await;
        info!("Shutting down");
        self.inner.queue.shut_down();
        release
            .release_after(async move { while tasks.join_next().await.is_some() {} })
            .await;
    }

    async fn worker(self) {
        debug!("Started");
        while self.process_next_work_item().await {}
        debug!("Stopped");
    }

    /// Processes a single node from the work queue, returning false once the queue is shut down.
    pub(crate) async fn process_next_work_item(&self) -> bool {
        let Some(name) = self.inner.queue.get().await else {
            return false;
        };

        let result = self.sync_node_route(&name).await;
        self.handle_result(&name, result);
        self.inner.queue.done(&name);
        self.inner.initial_list.processed(&name);
        true
    }

    fn handle_result(&self, name: &str, result: Result<(), SyncError>) {
        let metrics = &self.inner.metrics;
        let error = match result {
            Ok(()) => {
                self.inner.queue.forget(&name.to_string());
                metrics.sync(SyncResult::Ok);
                return;
            }
            Err(error) => error,
        };

        match &error {
            SyncError::InvalidNode(_) => {
                warn!(node = %name, %error, "Ignoring invalid node until it is updated");
                metrics.sync(SyncResult::Invalid);
                self.inner.queue.forget(&name.to_string());
                return;
            }
            SyncError::NotReady(_) => {
                info!(node = %name, %error, "Node is not ready; retrying");
                metrics.sync(SyncResult::NotReady);
            }
            SyncError::Conflict { .. } => {
                warn!(node = %name, %error, "Skipping node with conflicting pod CIDRs; retrying");
                metrics.sync(SyncResult::Conflict);
            }
            SyncError::Backend(_) => {
                error!(node = %name, error = format_args!("{error:#}"), "Failed to sync node routes; retrying");
                metrics.sync(SyncResult::Error);
            }
        }
        metrics.requeued();
        self.inner.queue.add_rate_limited(name.to_string());
    }

    /// Reconciles the dataplane with the current state of a node.
    #[instrument(skip(self), fields(node = %name))]
    pub async fn sync_node_route(&self, name: &str) -> Result<(), SyncError> {
        if name == self.inner.node.name {
            trace!("Ignoring local node");
            return Ok(());
        }

        let node = self.inner.nodes.read().get(name).cloned();
        let Some(node) = node else {
            debug!("Node no longer exists");
            return Ok(self.delete_node_route(name).await?);
        };

        let view = k8s::node_view(&node)?;
        if !view.has_address() || view.pod_cidrs.is_empty() {
            debug!(
                addresses = view.has_address(),
                pod_cidrs = view.pod_cidrs.len(),
                "Node has no pod CIDRs or addresses to route to"
            );
            return Ok(self.delete_node_route(name).await?);
        }

        let desired = self.desired_state(&view);
        {
            let mut installed = self.inner.installed.lock();
            if installed.get(name) == Some(&desired) {
                trace!("Node routes are up to date");
                return Ok(());
            }
            installed.claim(name, &desired.pod_cidrs)?;
        }

        let prior = match self.install_node_route(&view, &desired).await {
            Ok(prior) => prior,
            Err(error) => {
                self.inner.installed.lock().release(name);
                return Err(error);
            }
        };

        let stale = prior
            .iter()
            .flat_map(|info| info.pod_cidrs.iter())
            .filter(|cidr| !desired.pod_cidrs.contains(cidr))
            .copied()
            .collect::<Vec<_>>();
        for cidr in &stale {
            if let Err(error) = self.inner.routes.delete_routes(cidr).await {
                self.inner.installed.lock().release(name);
                return Err(error.into());
            }
        }

        let added = desired.pod_cidrs.clone();
        let installed = {
            let mut installed = self.inner.installed.lock();
            installed.commit(desired);
            installed.len()
        };
        self.inner.pod_subnets.replace(&stale, &added);
        self.inner.metrics.set_installed(installed);
        info!(pod_cidrs = ?added, "Installed node routes");
        Ok(())
    }

    /// Programs the dataplane for a node, returning the node's previously installed state.
    async fn install_node_route(
        &self,
        view: &NodeView,
        desired: &NodeRouteInfo,
    ) -> Result<Option<NodeRouteInfo>, SyncError> {
        let handle = self
            .inner
            .tunnels
            .ensure_peer_port(
                &view.name,
                view.peer_ips(),
                view.wireguard_public_key.as_deref(),
            )
            .await?;

        let peer_pod_cidrs = view.peer_pod_cidrs();
        self.inner
            .flows
            .install_node_flows(&view.name, &peer_pod_cidrs, &desired.peer_ips, handle, view.mac)
            .await?;

        for peer in &peer_pod_cidrs {
            let node_ip = desired.node_ips.for_net(&peer.cidr);
            self.inner
                .routes
                .add_routes(&peer.cidr, &view.name, node_ip, peer.gateway)
                .await?;
        }

        Ok(self.inner.installed.lock().get(&view.name).cloned())
    }

    /// Removes everything installed for a node.
    ///
    /// Deleting a node that was never installed does nothing.
    #[instrument(skip(self), fields(node = %name))]
    pub async fn delete_node_route(&self, name: &str) -> anyhow::Result<()> {
        let installed = self.inner.installed.lock().get(name).cloned();
        let Some(info) = installed else {
            self.inner.installed.lock().release(name);
            return self.inner.tunnels.remove_peer(name, false).await;
        };

        for cidr in &info.pod_cidrs {
            self.inner.routes.delete_routes(cidr).await?;
        }
        self.inner.flows.uninstall_node_flows(name).await?;
        self.inner.tunnels.remove_peer(name, true).await?;

        let installed = {
            let mut installed = self.inner.installed.lock();
            installed.remove(name);
            installed.release(name);
            installed.len()
        };
        self.inner.pod_subnets.replace(&info.pod_cidrs, &[]);
        self.inner.metrics.set_installed(installed);
        info!(pod_cidrs = ?info.pod_cidrs, "Deleted node routes");
        Ok(())
    }

    fn desired_state(&self, view: &NodeView) -> NodeRouteInfo {
        let peer = match &self.inner.network.encryption {
            EncryptionMode::None | EncryptionMode::Overlay => PeerIdentity::None,
            EncryptionMode::IpsecPsk { .. } => PeerIdentity::Psk,
            EncryptionMode::IpsecCert => PeerIdentity::Certificate,
            EncryptionMode::PeerMesh => PeerIdentity::PeerMesh {
                public_key: view.wireguard_public_key.clone().unwrap_or_default(),
            },
        };
        NodeRouteInfo {
            node_name: view.name.clone(),
            pod_cidrs: view.pod_cidrs.clone(),
            node_ips: view.node_ips,
            peer_ips: *view.peer_ips(),
            gateway_ips: view
                .peer_pod_cidrs()
                .into_iter()
                .map(|peer| peer.gateway)
                .collect(),
            mac: view.mac,
            peer,
        }
    }

    #[cfg(test)]
    pub(crate) fn installed(&self, name: &str) -> Option<NodeRouteInfo> {
        self.inner.installed.lock().get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &WorkQueue<String> {
        &self.inner.queue
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> &ControllerMetrics {
        &self.inner.metrics
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("node", &self.inner.node.name)
            .field("network", &self.inner.network)
            .finish_non_exhaustive()
    }
}

// === impl SyncError ===

impl SyncError {
    /// Whether the node should be retried without waiting for it to change.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidNode(_))
    }
}

impl From<CidrConflict> for SyncError {
    fn from(CidrConflict { cidr, owner }: CidrConflict) -> Self {
        Self::Conflict { cidr, owner }
    }
}

impl From<TunnelError> for SyncError {
    fn from(error: TunnelError) -> Self {
        match error {
            TunnelError::Backend(error) => Self::Backend(error),
            error => Self::NotReady(error.to_string()),
        }
    }
}
