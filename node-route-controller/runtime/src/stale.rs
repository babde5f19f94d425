//! Removes dataplane state left behind by a previous run.
//!
//! Nodes may be deleted (or change their configuration) while the controller is not running, so
//! before processing any node the controller compares what exists in each backend with the nodes
//! in the initial listing and removes whatever is no longer wanted. Each pass is independent: a
//! failure is logged and the remaining passes still run.

use crate::{
    core::{DualStackIps, EncryptionMode, IpNet, NodeView},
    k8s::{self, ResourceExt},
    Controller,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use std::collections::HashMap as StdHashMap;
use tracing::{debug, info, instrument, warn};

// === impl Controller ===

impl Controller {
    /// Runs every stale-state pass, returning the number of passes that failed.
    pub(crate) async fn remove_stale_state(&self) -> usize {
        let nodes = self.remote_node_views();
        let mut failures = 0;

        if let Err(error) = self.remove_stale_tunnel_ports(&nodes).await {
            warn!(error = format_args!("{error:#}"), "Failed to remove stale tunnel ports");
            failures += 1;
        }

        if let Err(error) = self.remove_stale_gateway_routes(&nodes).await {
            warn!(error = format_args!("{error:#}"), "Failed to remove stale routes");
            failures += 1;
        }

        if let EncryptionMode::PeerMesh = self.network().encryption {
            if let Err(error) = self.remove_stale_peers(&nodes).await {
                warn!(error = format_args!("{error:#}"), "Failed to remove stale peers");
                failures += 1;
            }
        }

        failures
    }

    /// Deletes per-node tunnel ports whose node no longer exists or whose configuration no longer
    /// matches, caching the ports that remain in use.
    #[instrument(skip_all)]
    pub(crate) async fn remove_stale_tunnel_ports(&self, nodes: &[NodeView]) -> Result<()> {
        let peers = nodes
            .iter()
            .map(|node| (node.name.clone(), *node.peer_ips()))
            .collect::<HashMap<String, DualStackIps>>();
        let deleted = self.tunnels().remove_stale_ports(&peers).await?;
        if deleted > 0 {
            info!(deleted, "Removed stale tunnel ports");
        }
        Ok(())
    }

    /// Removes routes to any pod CIDR that does not belong to a known remote node.
    #[instrument(skip_all)]
    pub(crate) async fn remove_stale_gateway_routes(&self, nodes: &[NodeView]) -> Result<()> {
        let pod_cidrs = nodes
            .iter()
            .flat_map(|node| node.pod_cidrs.iter().copied())
            .collect::<Vec<IpNet>>();
        self.routes().reconcile(&pod_cidrs).await
    }

    /// Removes peer-mesh peers that do not belong to a known remote node.
    #[instrument(skip_all)]
    pub(crate) async fn remove_stale_peers(&self, nodes: &[NodeView]) -> Result<()> {
        let expected = nodes
            .iter()
            .filter_map(|node| {
                let key = node.wireguard_public_key.clone()?;
                Some((node.name.clone(), key))
            })
            .collect::<StdHashMap<String, String>>();
        self.peer_mesh().remove_stale_peers(&expected).await
    }

    /// Returns the views of all remote nodes, ordered by name. Nodes that cannot be parsed are
    /// skipped; they are reported again when they are reconciled.
    fn remote_node_views(&self) -> Vec<NodeView> {
        let index = self.nodes().read();
        let mut views = index
            .remote_nodes()
            .filter_map(|node| match k8s::node_view(node) {
                Ok(view) => Some(view),
                Err(error) => {
                    debug!(node = %node.name_unchecked(), %error, "Skipping invalid node");
                    None
                }
            })
            .collect::<Vec<_>>();
        drop(index);
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }
}
