//! Caches cluster `Node`s and enqueues the ones whose routing state changed.

use crate::WorkQueue;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kubert::index::{ClusterRemoved, IndexClusterResource};
use noderoute_controller_k8s_api::{
    self as k8s,
    node::{
        MAC_ADDRESS_ANNOTATION, TRANSPORT_ADDRESSES_ANNOTATION, WIREGUARD_PUBLIC_KEY_ANNOTATION,
    },
    ResourceExt,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

pub type SharedNodeIndex = Arc<RwLock<NodeIndex>>;

/// Publishes the names of the remote nodes in the first complete listing of the cluster's nodes.
pub type InitialListRx = watch::Receiver<Option<Arc<[String]>>>;

#[derive(Debug)]
pub struct NodeIndex {
    local_node_name: String,
    nodes: HashMap<String, k8s::Node>,
    queue: WorkQueue<String>,
    initial_list: watch::Sender<Option<Arc<[String]>>>,
}

/// Annotations that affect how a node is reached.
const ROUTING_ANNOTATIONS: [&str; 3] = [
    MAC_ADDRESS_ANNOTATION,
    TRANSPORT_ADDRESSES_ANNOTATION,
    WIREGUARD_PUBLIC_KEY_ANNOTATION,
];

// === impl NodeIndex ===

impl NodeIndex {
    pub fn shared(
        local_node_name: impl Into<String>,
        queue: WorkQueue<String>,
    ) -> (SharedNodeIndex, InitialListRx) {
        let (initial_list, initial_list_rx) = watch::channel(None);
        let index = Self {
            local_node_name: local_node_name.into(),
            nodes: HashMap::default(),
            queue,
            initial_list,
        };
        (Arc::new(RwLock::new(index)), initial_list_rx)
    }

    pub fn local_node_name(&self) -> &str {
        &self.local_node_name
    }

    pub fn get(&self, name: &str) -> Option<&k8s::Node> {
        self.nodes.get(name)
    }

    /// Iterates over all known nodes other than the local node.
    pub fn remote_nodes(&self) -> impl Iterator<Item = &k8s::Node> + '_ {
        self.nodes
            .iter()
            .filter(|(name, _)| **name != self.local_node_name)
            .map(|(_, node)| node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn enqueue(&self, name: String) {
        if name == self.local_node_name {
            trace!(node = %name, "Skipping local node");
            return;
        }
        self.queue.add(name);
    }
}

impl IndexClusterResource<k8s::Node> for NodeIndex {
    #[instrument(skip_all, fields(node = %node.name_unchecked()))]
    fn apply(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();
        let changed = self
            .nodes
            .get(&name)
            .map_or(true, |prior| routing_changed(prior, &node));
        self.nodes.insert(name.clone(), node);
        if changed {
            debug!("Node updated");
            self.enqueue(name);
        } else {
            trace!("Ignoring node update");
        }
    }

    #[instrument(skip(self))]
    fn delete(&mut self, name: String) {
        if self.nodes.remove(&name).is_some() {
            debug!("Node deleted");
        }
        self.enqueue(name);
    }

    #[instrument(skip_all, fields(nodes = nodes.len()))]
    fn reset(&mut self, nodes: Vec<k8s::Node>, removed: ClusterRemoved) {
        let prior = self.nodes.keys().cloned().collect::<Vec<_>>();
        let mut listed = HashSet::with_capacity(nodes.len());
        let mut remote = Vec::with_capacity(nodes.len());
        for node in nodes {
            let name = node.name_unchecked();
            if name != self.local_node_name {
                remote.push(name.clone());
            }
            listed.insert(name);
            self.apply(node);
        }

        let stale = prior
            .into_iter()
            .chain(removed)
            .filter(|name| !listed.contains(name))
            .collect::<HashSet<_>>();
        for name in stale {
            self.delete(name);
        }

        self.initial_list.send_if_modified(|list| {
            if list.is_some() {
                return false;
            }
            debug!(nodes = remote.len(), "Listed initial nodes");
            *list = Some(remote.into());
            true
        });
    }
}

fn routing_changed(prior: &k8s::Node, node: &k8s::Node) -> bool {
    if k8s::pod_cidrs(prior) != k8s::pod_cidrs(node) {
        return true;
    }

    let addresses = |node: &k8s::Node| {
        node.status
            .as_ref()
            .and_then(|status| status.addresses.clone())
            .unwrap_or_default()
    };
    if addresses(prior) != addresses(node) {
        return true;
    }

    ROUTING_ANNOTATIONS
        .iter()
        .any(|key| prior.annotations().get(*key) != node.annotations().get(*key))
}
