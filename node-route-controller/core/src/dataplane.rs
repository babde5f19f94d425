//! Interfaces of the dataplane backends driven by the controller.
//!
//! Every backend method may fail; the controller treats any such failure as transient and
//! retries the affected node later.

use crate::{DualStackIps, MacAddr, TunnelType};
use anyhow::Result;
use ipnet::IpNet;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::IpAddr,
    sync::Arc,
};

/// Port metadata key naming the node a tunnel port was created for.
pub const EXTERNAL_ID_NODE_NAME: &str = "noderoute.io/node-name";

/// Port metadata key describing the role of a port.
pub const EXTERNAL_ID_INTERFACE_TYPE: &str = "noderoute.io/interface-type";

pub const INTERFACE_TYPE_TUNNEL: &str = "tunnel";
pub const INTERFACE_TYPE_IPSEC_TUNNEL: &str = "ipsec-tunnel";

/// A remote pod CIDR and the gateway address within it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerPodCidr {
    pub cidr: IpNet,
    pub gateway: IpAddr,
}

/// The parameters of a tunnel port to be created on the bridge.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelPortSpec {
    pub name: String,
    pub tunnel_type: TunnelType,

    /// Zero selects the tunnel type's default port.
    pub dst_port: u16,

    pub remote_ip: IpAddr,

    /// The expected certificate subject of the peer, in certificate-authenticated IPsec mode.
    pub remote_name: Option<String>,

    pub psk: Option<String>,

    /// Metadata attached to the port so that its owner can be recovered after a restart.
    pub external_ids: BTreeMap<String, String>,
}

/// A port as reported by the bridge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortData {
    pub uuid: String,
    pub name: String,
    pub if_type: String,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,

    /// The port's forwarding handle, or zero if none has been allocated yet.
    pub handle: u32,
}

/// Installs the forwarding flows that steer traffic to a remote node's pods.
#[async_trait::async_trait]
pub trait FlowClient: Send + Sync {
    /// Installs (or replaces) the flows for `node_name`.
    ///
    /// `tunnel_port` is the forwarding handle of a dedicated tunnel port, or zero if traffic is
    /// forwarded without one.
    async fn install_node_flows(
        &self,
        node_name: &str,
        peer_pod_cidrs: &[PeerPodCidr],
        peer_ips: &DualStackIps,
        tunnel_port: u32,
        peer_mac: Option<MacAddr>,
    ) -> Result<()>;

    async fn uninstall_node_flows(&self, node_name: &str) -> Result<()>;
}

/// Manages host routes to remote pod CIDRs.
#[async_trait::async_trait]
pub trait RouteClient: Send + Sync {
    async fn add_routes(
        &self,
        pod_cidr: &IpNet,
        node_name: &str,
        node_ip: Option<IpAddr>,
        gateway: IpAddr,
    ) -> Result<()>;

    async fn delete_routes(&self, pod_cidr: &IpNet) -> Result<()>;

    /// Removes routes for any pod CIDR not in `pod_cidrs` and adds any missing ones.
    async fn reconcile(&self, pod_cidrs: &[IpNet]) -> Result<()>;
}

/// Manages ports on the local bridge.
#[async_trait::async_trait]
pub trait BridgeClient: Send + Sync {
    /// Creates a tunnel port, returning its UUID.
    async fn create_tunnel_port(&self, spec: &TunnelPortSpec) -> Result<String>;

    async fn get_port_handle(&self, name: &str) -> Result<u32>;

    async fn delete_port(&self, uuid: &str) -> Result<()>;

    /// Excludes a port from flooded traffic.
    async fn set_no_flood(&self, handle: u32) -> Result<()>;

    async fn enumerate_ports(&self) -> Result<Vec<PortData>>;
}

/// Manages the peers of a WireGuard mesh.
#[async_trait::async_trait]
pub trait PeerMeshClient: Send + Sync {
    async fn upsert_peer(
        &self,
        node_name: &str,
        public_key: &str,
        endpoint: &DualStackIps,
    ) -> Result<()>;

    async fn delete_peer(&self, node_name: &str) -> Result<()>;

    /// Removes every peer that is not in `expected`, a map of node names to public keys.
    async fn remove_stale_peers(&self, expected: &HashMap<String, String>) -> Result<()>;
}

/// Reports whether IPsec certificates have been provisioned.
pub trait CertificateReadiness: Send + Sync {
    fn has_synced(&self) -> bool;
}

/// The set of backends the controller drives.
#[derive(Clone)]
pub struct Dataplane {
    pub flows: Arc<dyn FlowClient>,
    pub routes: Arc<dyn RouteClient>,
    pub bridge: Arc<dyn BridgeClient>,
    pub peer_mesh: Arc<dyn PeerMeshClient>,
    pub certificates: Arc<dyn CertificateReadiness>,
}

// === impl TunnelPortSpec ===

impl TunnelPortSpec {
    pub fn node_name(&self) -> Option<&str> {
        self.external_ids
            .get(EXTERNAL_ID_NODE_NAME)
            .map(String::as_str)
    }
}

impl fmt::Debug for TunnelPortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelPortSpec")
            .field("name", &self.name)
            .field("tunnel_type", &self.tunnel_type)
            .field("dst_port", &self.dst_port)
            .field("remote_ip", &self.remote_ip)
            .field("remote_name", &self.remote_name)
            .field("psk", &self.psk.as_ref().map(|_| "<redacted>"))
            .field("external_ids", &self.external_ids)
            .finish()
    }
}

// === impl PortData ===

impl PortData {
    /// The node this port was created for, if any.
    pub fn node_name(&self) -> Option<&str> {
        self.external_ids
            .get(EXTERNAL_ID_NODE_NAME)
            .map(String::as_str)
    }
}

impl fmt::Debug for Dataplane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataplane").finish_non_exhaustive()
    }
}
