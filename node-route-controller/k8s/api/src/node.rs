//! Extracts the routing-relevant parts of a `Node`.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use noderoute_controller_core::{DualStackIps, InvalidMac, IpNet, MacAddr, NodeView};
use std::net::{AddrParseError, IpAddr};

/// The MAC address of the node's transport interface, used when traffic to the node is not
/// encapsulated.
pub const MAC_ADDRESS_ANNOTATION: &str = "node.noderoute.io/mac-address";

/// A comma-separated list of addresses that tunnels to the node terminate on, when they differ
/// from the node's internal addresses.
pub const TRANSPORT_ADDRESSES_ANNOTATION: &str = "node.noderoute.io/transport-addresses";

/// The node's WireGuard public key.
pub const WIREGUARD_PUBLIC_KEY_ANNOTATION: &str = "node.noderoute.io/wireguard-public-key";

const INTERNAL_IP: &str = "InternalIP";
const EXTERNAL_IP: &str = "ExternalIP";

#[derive(Debug, thiserror::Error)]
pub enum InvalidNode {
    #[error("node has no name")]
    MissingName,

    #[error("failed to parse pod CIDR {value:?}: {source}")]
    PodCidr {
        value: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("failed to parse address {value:?}: {source}")]
    Address {
        value: String,
        #[source]
        source: AddrParseError,
    },

    #[error("failed to parse MAC {value:?}: {source}")]
    Mac {
        value: String,
        #[source]
        source: InvalidMac,
    },
}

/// Returns the node's pod CIDRs as declared, preferring `spec.podCIDRs` over the legacy
/// `spec.podCIDR`.
pub fn pod_cidrs(node: &Node) -> Vec<String> {
    let Some(spec) = node.spec.as_ref() else {
        return vec![];
    };
    match spec.pod_cidrs.as_ref() {
        Some(cidrs) if !cidrs.is_empty() => cidrs.clone(),
        _ => spec.pod_cidr.iter().cloned().collect(),
    }
}

/// Returns the MAC address advertised by the node, if any.
pub fn node_mac(node: &Node) -> Result<Option<MacAddr>, InvalidNode> {
    let value = match node.annotations().get(MAC_ADDRESS_ANNOTATION) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(None),
    };
    value
        .parse()
        .map(Some)
        .map_err(|source| InvalidNode::Mac {
            value: value.clone(),
            source,
        })
}

/// Builds the typed view of a node.
///
/// Pod CIDRs are normalized so that host bits are cleared.
///
/// A node without any reported address yields a view without addresses rather than an error; it
/// is up to the caller to decide what an unreachable node means.
pub fn node_view(node: &Node) -> Result<NodeView, InvalidNode> {
    let name = node
        .metadata
        .name
        .clone()
        .ok_or(InvalidNode::MissingName)?;

    let pod_cidrs = pod_cidrs(node)
        .into_iter()
        .map(|value| match value.parse::<IpNet>() {
            Ok(net) => Ok(net.trunc()),
            Err(source) => Err(InvalidNode::PodCidr { value, source }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let transport_ips = match node.annotations().get(TRANSPORT_ADDRESSES_ANNOTATION) {
        Some(value) => parse_ips(value.split(',').map(str::trim).filter(|s| !s.is_empty()))?,
        None => DualStackIps::default(),
    };

    Ok(NodeView {
        name,
        node_ips: node_ips(node)?,
        transport_ips,
        pod_cidrs,
        mac: node_mac(node)?,
        wireguard_public_key: node
            .annotations()
            .get(WIREGUARD_PUBLIC_KEY_ANNOTATION)
            .filter(|key| !key.is_empty())
            .cloned(),
    })
}

/// Returns the node's internal addresses, or its external addresses if it reports no internal
/// ones.
fn node_ips(node: &Node) -> Result<DualStackIps, InvalidNode> {
    let addresses = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_deref())
        .unwrap_or_default();

    let of_type = move |ty: &'static str| {
        addresses
            .iter()
            .filter(move |addr| addr.type_ == ty)
            .map(|addr| addr.address.as_str())
    };

    let ips = parse_ips(of_type(INTERNAL_IP))?;
    if !ips.is_empty() {
        return Ok(ips);
    }
    parse_ips(of_type(EXTERNAL_IP))
}

fn parse_ips<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<DualStackIps, InvalidNode> {
    values
        .into_iter()
        .map(|value| {
            value.parse::<IpAddr>().map_err(|source| InvalidNode::Address {
                value: value.to_string(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn mk_node(
        annotations: std::collections::BTreeMap<String, String>,
        pod_cidr: Option<&str>,
        pod_cidrs: Vec<&str>,
        addresses: Vec<(&str, &str)>,
    ) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                pod_cidr: pod_cidr.map(Into::into),
                pod_cidrs: Some(pod_cidrs.into_iter().map(Into::into).collect()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .into_iter()
                        .map(|(type_, address)| NodeAddress {
                            type_: type_.to_string(),
                            address: address.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn pod_cidrs_prefer_list() {
        let node = mk_node(
            Default::default(),
            Some("1.1.0.0/24"),
            vec!["1.1.1.0/24", "aabb:ccdd::/64"],
            vec![],
        );
        assert_eq!(pod_cidrs(&node), vec!["1.1.1.0/24", "aabb:ccdd::/64"]);

        let node = mk_node(Default::default(), Some("1.1.0.0/24"), vec![], vec![]);
        assert_eq!(pod_cidrs(&node), vec!["1.1.0.0/24"]);

        let node = mk_node(Default::default(), None, vec![], vec![]);
        assert!(pod_cidrs(&node).is_empty());
    }

    #[test]
    fn mac_annotation() {
        let node = mk_node(
            btreemap! { MAC_ADDRESS_ANNOTATION.to_string() => "00:1B:44:11:3A:B7".to_string() },
            None,
            vec![],
            vec![],
        );
        assert_eq!(
            node_mac(&node).unwrap(),
            Some(MacAddr::new([0x00, 0x1b, 0x44, 0x11, 0x3a, 0xb7]))
        );

        let node = mk_node(
            btreemap! { MAC_ADDRESS_ANNOTATION.to_string() => String::new() },
            None,
            vec![],
            vec![],
        );
        assert_eq!(node_mac(&node).unwrap(), None);

        let node = mk_node(
            btreemap! { MAC_ADDRESS_ANNOTATION.to_string() => "invalid-MAC".to_string() },
            None,
            vec![],
            vec![],
        );
        let error = node_mac(&node).unwrap_err();
        assert!(
            error.to_string().contains("failed to parse MAC"),
            "{error}"
        );
    }

    #[test]
    fn dual_stack_view() {
        let node = mk_node(
            btreemap! {
                TRANSPORT_ADDRESSES_ANNOTATION.to_string() => "192.168.0.10, fd00::10".to_string(),
                WIREGUARD_PUBLIC_KEY_ANNOTATION.to_string() => "key-1".to_string(),
            },
            None,
            vec!["1.1.1.0/24", "aabb:ccdd::/64"],
            vec![
                ("Hostname", "node-1"),
                ("InternalIP", "10.10.10.10"),
                ("InternalIP", "aabb:ccdd::1"),
                ("ExternalIP", "203.0.113.10"),
            ],
        );
        let view = node_view(&node).unwrap();
        assert_eq!(view.name, "node-1");
        assert_eq!(view.node_ips.ipv4, Some("10.10.10.10".parse().unwrap()));
        assert_eq!(view.node_ips.ipv6, Some("aabb:ccdd::1".parse().unwrap()));
        assert_eq!(
            view.transport_ips.ipv4,
            Some("192.168.0.10".parse().unwrap())
        );
        assert_eq!(view.transport_ips.ipv6, Some("fd00::10".parse().unwrap()));
        assert_eq!(
            view.pod_cidrs,
            vec![
                "1.1.1.0/24".parse::<IpNet>().unwrap(),
                "aabb:ccdd::/64".parse().unwrap()
            ]
        );
        assert_eq!(view.wireguard_public_key.as_deref(), Some("key-1"));
    }

    #[test]
    fn falls_back_to_external_ips() {
        let node = mk_node(
            Default::default(),
            Some("1.1.1.0/24"),
            vec![],
            vec![("ExternalIP", "203.0.113.10")],
        );
        let view = node_view(&node).unwrap();
        assert_eq!(
            view.node_ips.preferred(),
            Some("203.0.113.10".parse().unwrap())
        );
        assert!(view.transport_ips.is_empty());
    }

    #[test]
    fn pod_cidrs_clear_host_bits() {
        let node = mk_node(
            Default::default(),
            None,
            vec!["1.1.1.7/24", "fd00:10:1::5/64"],
            vec![("InternalIP", "10.10.10.10")],
        );
        let view = node_view(&node).expect("node must be valid");
        assert_eq!(
            view.pod_cidrs,
            vec![
                "1.1.1.0/24".parse::<IpNet>().unwrap(),
                "fd00:10:1::/64".parse::<IpNet>().unwrap(),
            ]
        );
    }

    #[test]
    fn rejects_malformed_input() {
        let node = mk_node(Default::default(), Some("1.1.1.0/33"), vec![], vec![]);
        assert!(matches!(
            node_view(&node),
            Err(InvalidNode::PodCidr { .. })
        ));

        let node = mk_node(
            Default::default(),
            Some("1.1.1.0/24"),
            vec![],
            vec![("InternalIP", "10.10.10")],
        );
        assert!(matches!(
            node_view(&node),
            Err(InvalidNode::Address { .. })
        ));

        let node = mk_node(
            btreemap! { TRANSPORT_ADDRESSES_ANNOTATION.to_string() => "nope".to_string() },
            Some("1.1.1.0/24"),
            vec![],
            vec![("InternalIP", "10.10.10.10")],
        );
        assert!(matches!(
            node_view(&node),
            Err(InvalidNode::Address { .. })
        ));
    }
}
