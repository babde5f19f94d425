use noderoute_controller_core::{gateway_ip, IpNet};
use parking_lot::RwLock;
use std::{collections::BTreeSet, net::IpAddr, sync::Arc};

/// The set of pod CIDRs reachable from this node, including its own.
///
/// All pod CIDRs of an IP family share the mask length of the local node's CIDR in that family,
/// so a lookup only needs to truncate the address once per family. Families for which the local
/// node has no pod CIDR are never matched.
#[derive(Clone, Debug)]
pub struct PodSubnets(Arc<Inner>);

/// The result of looking up an address in [`PodSubnets`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SubnetMatch {
    pub in_pod_subnets: bool,
    pub is_gateway: bool,
}

#[derive(Debug)]
struct Inner {
    v4_prefix_len: Option<u8>,
    v6_prefix_len: Option<u8>,
    local: BTreeSet<IpNet>,
    prefixes: RwLock<BTreeSet<IpNet>>,
}

// === impl PodSubnets ===

impl PodSubnets {
    /// Creates an index holding the local node's pod CIDRs.
    pub fn new(local_pod_cidrs: &[IpNet]) -> Self {
        let prefix_len = |v4: bool| {
            local_pod_cidrs
                .iter()
                .find(|net| matches!(net, IpNet::V4(_)) == v4)
                .map(IpNet::prefix_len)
        };
        let mut inner = Inner {
            v4_prefix_len: prefix_len(true),
            v6_prefix_len: prefix_len(false),
            local: BTreeSet::new(),
            prefixes: RwLock::new(BTreeSet::new()),
        };
        inner.local = local_pod_cidrs
            .iter()
            .filter_map(|net| inner.normalize(net.addr()))
            .collect();
        *inner.prefixes.get_mut() = inner.local.clone();
        Self(Arc::new(inner))
    }

    /// Determines whether `ip` is in a known pod CIDR and whether it is that CIDR's gateway.
    pub fn lookup(&self, ip: IpAddr) -> SubnetMatch {
        let Some(prefix) = self.0.normalize(ip) else {
            return SubnetMatch::default();
        };
        if !self.0.prefixes.read().contains(&prefix) {
            return SubnetMatch::default();
        }
        SubnetMatch {
            in_pod_subnets: true,
            is_gateway: gateway_ip(&prefix) == ip,
        }
    }

    /// Removes and adds pod CIDRs in a single update, so that concurrent lookups observe either
    /// the prior or the new set.
    ///
    /// The local node's pod CIDRs are never removed.
    pub fn replace(&self, removed: &[IpNet], added: &[IpNet]) {
        let removed = removed
            .iter()
            .filter_map(|net| self.0.normalize(net.addr()))
            .filter(|net| !self.0.local.contains(net))
            .collect::<Vec<_>>();
        let added = added
            .iter()
            .filter_map(|net| self.0.normalize(net.addr()))
            .collect::<Vec<_>>();
        if removed.is_empty() && added.is_empty() {
            return;
        }

        let mut prefixes = self.0.prefixes.write();
        for net in removed {
            prefixes.remove(&net);
        }
        prefixes.extend(added);
    }

    pub fn contains(&self, net: &IpNet) -> bool {
        self.0
            .normalize(net.addr())
            .is_some_and(|net| self.0.prefixes.read().contains(&net))
    }

    pub fn len(&self) -> usize {
        self.0.prefixes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.prefixes.read().is_empty()
    }

    /// Returns a snapshot of the indexed prefixes.
    pub fn prefixes(&self) -> Vec<IpNet> {
        self.0.prefixes.read().iter().copied().collect()
    }
}

// === impl Inner ===

impl Inner {
    /// Truncates `ip` to the pod CIDR mask length of its family.
    fn normalize(&self, ip: IpAddr) -> Option<IpNet> {
        let prefix_len = match ip {
            IpAddr::V4(_) => self.v4_prefix_len?,
            IpAddr::V6(_) => self.v6_prefix_len?,
        };
        IpNet::new(ip, prefix_len).ok().map(|net| net.trunc())
    }
}
