use crate::{dataplane::PeerPodCidr, MacAddr};
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// At most one address per IP family.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DualStackIps {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// A typed view of a cluster `Node`, holding only what the controller needs to program routes to
/// it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeView {
    pub name: String,

    /// The node's own addresses, used as the next hop of host routes.
    pub node_ips: DualStackIps,

    /// Addresses used as tunnel endpoints. Empty unless the node advertises dedicated transport
    /// addresses.
    pub transport_ips: DualStackIps,

    /// The node's pod CIDRs: at most one per IP family.
    pub pod_cidrs: Vec<IpNet>,

    pub mac: Option<MacAddr>,

    pub wireguard_public_key: Option<String>,
}

/// The identity a remote node is peered with, as determined by the encryption mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerIdentity {
    None,
    Psk,
    Certificate,
    PeerMesh { public_key: String },
}

/// Tunnel interface names are bounded by the kernel's interface name length.
const MAX_INTERFACE_NAME_LEN: usize = 15;
const HASH_LEN: usize = 8;

/// The first usable address of a pod CIDR, which is assigned to the owning node's gateway.
pub fn gateway_ip(cidr: &IpNet) -> IpAddr {
    match cidr {
        IpNet::V4(net) => Ipv4Addr::from(u32::from(net.network()).wrapping_add(1)).into(),
        IpNet::V6(net) => Ipv6Addr::from(u128::from(net.network()).wrapping_add(1)).into(),
    }
}

/// Derives a stable, length-bounded tunnel interface name for a peer node.
///
/// The name keeps a readable prefix of the node name and appends a hash of the full name so that
/// nodes sharing a prefix do not collide.
pub fn tunnel_interface_name(node_name: &str) -> String {
    let digest = Sha256::digest(node_name.as_bytes());
    let hash = digest
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    let prefix = node_name
        .chars()
        .take(MAX_INTERFACE_NAME_LEN - HASH_LEN - 1)
        .collect::<String>();
    format!("{prefix}-{hash}")
}

// === impl DualStackIps ===

impl DualStackIps {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }

    /// Records an address if no address of its family is known yet.
    ///
    /// Returns false if the address was ignored.
    pub fn insert(&mut self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) if self.ipv4.is_none() => self.ipv4 = Some(ip),
            IpAddr::V6(ip) if self.ipv6.is_none() => self.ipv6 = Some(ip),
            _ => return false,
        }
        true
    }

    /// Returns the address of the same family as `net`.
    pub fn for_net(&self, net: &IpNet) -> Option<IpAddr> {
        match net {
            IpNet::V4(_) => self.ipv4.map(Into::into),
            IpNet::V6(_) => self.ipv6.map(Into::into),
        }
    }

    /// Returns the IPv4 address if there is one and the IPv6 address otherwise.
    pub fn preferred(&self) -> Option<IpAddr> {
        self.ipv4
            .map(IpAddr::from)
            .or_else(|| self.ipv6.map(Into::into))
    }

    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv4
            .map(IpAddr::from)
            .into_iter()
            .chain(self.ipv6.map(IpAddr::from))
    }
}

impl FromIterator<IpAddr> for DualStackIps {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut ips = Self::default();
        for ip in iter {
            ips.insert(ip);
        }
        ips
    }
}

impl From<IpAddr> for DualStackIps {
    fn from(ip: IpAddr) -> Self {
        Some(ip).into_iter().collect()
    }
}

// === impl NodeView ===

impl NodeView {
    /// Whether the node has any address that routes can point to.
    pub fn has_address(&self) -> bool {
        !self.node_ips.is_empty()
    }

    /// The addresses tunnels to this node terminate on.
    pub fn peer_ips(&self) -> &DualStackIps {
        if self.transport_ips.is_empty() {
            &self.node_ips
        } else {
            &self.transport_ips
        }
    }

    pub fn peer_pod_cidrs(&self) -> Vec<PeerPodCidr> {
        self.pod_cidrs
            .iter()
            .map(|cidr| PeerPodCidr {
                cidr: *cidr,
                gateway: gateway_ip(cidr),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn gateway_is_first_address() {
        let v4 = "10.1.0.0/24".parse().unwrap();
        assert_eq!(gateway_ip(&v4), "10.1.0.1".parse::<IpAddr>().unwrap());

        let v6 = "2001:4860:1::/48".parse().unwrap();
        assert_eq!(gateway_ip(&v6), "2001:4860:1::1".parse::<IpAddr>().unwrap());

        // Host bits are ignored.
        let unaligned = "10.1.0.7/24".parse().unwrap();
        assert_eq!(gateway_ip(&unaligned), "10.1.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn tunnel_interface_names_are_bounded_and_stable() {
        let long = tunnel_interface_name("a-very-long-node-name-in-a-large-cluster");
        assert!(long.len() <= MAX_INTERFACE_NAME_LEN, "{long}");
        assert!(long.starts_with("a-very-"), "{long}");
        assert_eq!(long, tunnel_interface_name("a-very-long-node-name-in-a-large-cluster"));

        // Names sharing a prefix are distinguished by the hash.
        assert_ne!(
            tunnel_interface_name("xyz-k8s-0-1"),
            tunnel_interface_name("xyz-k8s-0-2")
        );
        assert!(tunnel_interface_name("n1").len() <= MAX_INTERFACE_NAME_LEN);
    }

    #[test]
    fn dual_stack_keeps_first_per_family() {
        let ips = ["10.0.0.1", "10.0.0.2", "fd00::1"]
            .into_iter()
            .map(|s| s.parse::<IpAddr>().unwrap())
            .collect::<DualStackIps>();
        assert_eq!(ips.ipv4, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ips.ipv6, Some("fd00::1".parse().unwrap()));
        assert_eq!(ips.preferred(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ips.iter().count(), 2);
    }

    #[test]
    fn peer_ips_prefer_transport_addresses() {
        let mut node = NodeView {
            name: "node-0".to_string(),
            node_ips: "10.10.10.10".parse::<IpAddr>().unwrap().into(),
            transport_ips: DualStackIps::default(),
            pod_cidrs: vec!["1.1.1.0/24".parse().unwrap()],
            mac: None,
            wireguard_public_key: None,
        };
        assert_eq!(node.peer_ips(), &node.node_ips);

        node.transport_ips = "192.168.0.10".parse::<IpAddr>().unwrap().into();
        assert_eq!(
            node.peer_ips().preferred(),
            Some("192.168.0.10".parse().unwrap())
        );
        assert_eq!(
            node.peer_pod_cidrs(),
            vec![PeerPodCidr {
                cidr: "1.1.1.0/24".parse().unwrap(),
                gateway: "1.1.1.1".parse().unwrap(),
            }]
        );
    }
}
