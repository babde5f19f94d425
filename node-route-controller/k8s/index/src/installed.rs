use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use noderoute_controller_core::{DualStackIps, IpNet, MacAddr, PeerIdentity};
use std::net::IpAddr;

/// The routing state installed for a remote node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRouteInfo {
    pub node_name: String,
    pub pod_cidrs: Vec<IpNet>,

    /// The node's own addresses, used as next hops of host routes.
    pub node_ips: DualStackIps,

    /// The addresses the node's traffic is tunneled to.
    pub peer_ips: DualStackIps,

    /// The gateway address of each pod CIDR, in the same order.
    pub gateway_ips: Vec<IpAddr>,

    pub mac: Option<MacAddr>,
    pub peer: PeerIdentity,
}

/// Indicates that a pod CIDR is already owned by another node.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("pod CIDR {cidr} is already claimed by node {owner}")]
pub struct CidrConflict {
    pub cidr: IpNet,
    pub owner: String,
}

/// Records what has been installed for each remote node.
///
/// A pod CIDR is owned by at most one node. A node must claim its CIDRs before installing routes
/// for them; the claim is held until the node's state is committed or released, so that two nodes
/// being reconciled concurrently cannot both install the same CIDR.
#[derive(Debug, Default)]
pub struct InstalledNodes {
    by_name: HashMap<String, NodeRouteInfo>,
    by_cidr: HashMap<IpNet, String>,
    claims: HashMap<IpNet, String>,
}

// === impl InstalledNodes ===

impl InstalledNodes {
    pub fn get(&self, node_name: &str) -> Option<&NodeRouteInfo> {
        self.by_name.get(node_name)
    }

    /// Returns the node that owns (or is installing) `cidr`.
    pub fn owner(&self, cidr: &IpNet) -> Option<&str> {
        self.by_cidr
            .get(cidr)
            .or_else(|| self.claims.get(cidr))
            .map(String::as_str)
    }

    /// Reserves `pod_cidrs` for `node_name`, replacing any prior claim the node held.
    ///
    /// Fails without reserving anything if any CIDR overlaps a CIDR installed for, or claimed by,
    /// another node.
    pub fn claim(&mut self, node_name: &str, pod_cidrs: &[IpNet]) -> Result<(), CidrConflict> {
        for cidr in pod_cidrs {
            let owner = self
                .by_cidr
                .iter()
                .chain(self.claims.iter())
                .find(|(owned, owner)| *owner != node_name && overlaps(cidr, owned));
            if let Some((_, owner)) = owner {
                return Err(CidrConflict {
                    cidr: *cidr,
                    owner: owner.clone(),
                });
            }
        }

        self.release(node_name);
        for cidr in pod_cidrs {
            self.claims.insert(*cidr, node_name.to_string());
        }
        Ok(())
    }

    /// Drops any claim held by `node_name` without installing it.
    pub fn release(&mut self, node_name: &str) {
        self.claims.retain(|_, owner| owner != node_name);
    }

    /// Records the installed state of a node, replacing (not merging) any prior state, and
    /// returns the prior state.
    pub fn commit(&mut self, info: NodeRouteInfo) -> Option<NodeRouteInfo> {
        self.release(&info.node_name);
        let prior = self.remove(&info.node_name);
        for cidr in &info.pod_cidrs {
            self.by_cidr.insert(*cidr, info.node_name.clone());
        }
        self.by_name.insert(info.node_name.clone(), info);
        prior
    }

    /// Forgets everything installed for `node_name`, returning the prior state.
    pub fn remove(&mut self, node_name: &str) -> Option<NodeRouteInfo> {
        let info = self.by_name.remove(node_name)?;
        for cidr in &info.pod_cidrs {
            if self.by_cidr.get(cidr).is_some_and(|owner| owner == node_name) {
                self.by_cidr.remove(cidr);
            }
        }
        Some(info)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRouteInfo> + '_ {
        self.by_name.values()
    }

    pub fn node_names(&self) -> HashSet<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Whether two networks share any address.
fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}
