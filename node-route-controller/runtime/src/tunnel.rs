//! Per-peer tunnel ports and peer-mesh peers.

use crate::core::{
    dataplane::{
        BridgeClient, CertificateReadiness, PeerMeshClient, PortData, TunnelPortSpec,
        EXTERNAL_ID_INTERFACE_TYPE, EXTERNAL_ID_NODE_NAME, INTERFACE_TYPE_IPSEC_TUNNEL,
        INTERFACE_TYPE_TUNNEL,
    },
    tunnel_interface_name, DualStackIps, EncryptionMode, NetworkConfig, TunnelType,
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt, net::IpAddr, sync::Arc};
use tracing::{debug, info, instrument, warn};

const OPTION_REMOTE_IP: &str = "remote_ip";
const OPTION_PSK: &str = "psk";
const OPTION_REMOTE_NAME: &str = "remote_name";
const OPTION_DST_PORT: &str = "dst_port";

/// Creates and caches the tunnel ports (or peer-mesh peers) used to reach remote nodes.
///
/// Calls for a given node are serialized by the controller's work queue; the cache is locked only
/// to guard concurrent access from distinct nodes.
pub struct TunnelPortManager {
    network: NetworkConfig,
    bridge: Arc<dyn BridgeClient>,
    peer_mesh: Arc<dyn PeerMeshClient>,
    certificates: Arc<dyn CertificateReadiness>,
    ports: Mutex<TunnelPorts>,
}

/// The configuration of a tunnel port, as created by this controller or as found on the bridge.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelPortConfig {
    /// The node the port was created for. Ports without an owner are not managed per node.
    pub node_name: Option<String>,
    pub interface_name: String,
    pub tunnel_type: TunnelType,
    pub dst_port: u16,
    pub remote_ip: Option<IpAddr>,
    pub psk: Option<String>,
    pub remote_name: Option<String>,
    pub uuid: String,

    /// Zero until the bridge has allocated the port's forwarding handle.
    pub handle: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("IPsec certificates have not been provisioned yet")]
    CertificatesNotReady,

    #[error("node has no WireGuard public key")]
    MissingPublicKey,

    #[error("node has no tunnel address")]
    MissingPeerAddress,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Tunnel ports indexed by interface name, with a secondary index by node name.
#[derive(Debug, Default)]
struct TunnelPorts {
    by_interface: HashMap<String, TunnelPortConfig>,
    by_node: HashMap<String, String>,
}

// === impl TunnelPortManager ===

impl TunnelPortManager {
    pub fn new(
        network: NetworkConfig,
        bridge: Arc<dyn BridgeClient>,
        peer_mesh: Arc<dyn PeerMeshClient>,
        certificates: Arc<dyn CertificateReadiness>,
    ) -> Self {
        Self {
            network,
            bridge,
            peer_mesh,
            certificates,
            ports: Mutex::new(TunnelPorts::default()),
        }
    }

    /// Ensures that the node can be reached with the configured encryption mode, returning the
    /// forwarding handle of the node's dedicated tunnel port or zero if it has none.
    #[instrument(skip(self, peer_ips, public_key), fields(node = %node_name))]
    pub async fn ensure_peer_port(
        &self,
        node_name: &str,
        peer_ips: &DualStackIps,
        public_key: Option<&str>,
    ) -> Result<u32, TunnelError> {
        match &self.network.encryption {
            EncryptionMode::PeerMesh => {
                let public_key = public_key.ok_or(TunnelError::MissingPublicKey)?;
                self.peer_mesh
                    .upsert_peer(node_name, public_key, peer_ips)
                    .await?;
                Ok(0)
            }
            EncryptionMode::IpsecCert if !self.certificates.has_synced() => {
                Err(TunnelError::CertificatesNotReady)
            }
            _ if self.network.uses_per_node_ports() => {
                let remote_ip = peer_ips
                    .preferred()
                    .ok_or(TunnelError::MissingPeerAddress)?;
                self.ensure_tunnel_port(node_name, remote_ip).await
            }
            _ => Ok(0),
        }
    }

    async fn ensure_tunnel_port(&self, node_name: &str, remote_ip: IpAddr) -> Result<u32, TunnelError> {
        let desired = self.desired_port(node_name, remote_ip);

        let cached = self.ports.lock().get_by_node(node_name).cloned();
        if let Some(cached) = cached {
            if cached.matches(&desired) {
                if cached.handle != 0 {
                    return Ok(cached.handle);
                }
                debug!(interface = %cached.interface_name, "Configuring existing tunnel port");
                let handle = self.configure_port(&cached.interface_name).await?;
                self.ports.lock().insert(TunnelPortConfig { handle, ..cached });
                return Ok(handle);
            }

            info!(
                interface = %cached.interface_name,
                uuid = %cached.uuid,
                "Tunnel port configuration changed; recreating port"
            );
            self.bridge.delete_port(&cached.uuid).await?;
            self.ports.lock().remove_node(node_name);
        }

        // The cache may not know every port the bridge has for this node.
        if let Some(existing) = self.remove_uncached_ports(node_name, &desired).await? {
            debug!(interface = %existing.interface_name, uuid = %existing.uuid, "Reusing tunnel port");
            let handle = self.configure_port(&existing.interface_name).await?;
            self.ports.lock().insert(TunnelPortConfig { handle, ..existing });
            return Ok(handle);
        }

        let uuid = self.bridge.create_tunnel_port(&desired).await?;
        info!(interface = %desired.name, %uuid, %remote_ip, "Created tunnel port");
        // Cache the port before it is configured so that a failure below does not leak it.
        let config = TunnelPortConfig::from_spec(&desired, uuid);
        self.ports.lock().insert(config.clone());

        let handle = self.configure_port(&desired.name).await?;
        self.ports.lock().insert(TunnelPortConfig { handle, ..config });
        Ok(handle)
    }

    /// Deletes the bridge ports that belong to the node, either by owner or by interface name,
    /// unless one can be used as-is for `desired`. Returns that port, if any.
    async fn remove_uncached_ports(
        &self,
        node_name: &str,
        desired: &TunnelPortSpec,
    ) -> Result<Option<TunnelPortConfig>> {
        let ports = self.bridge.enumerate_ports().await?;

        let mut reusable = None;
        for port in ports {
            if port.name != desired.name && port.node_name() != Some(node_name) {
                continue;
            }
            match TunnelPortConfig::from_port_data(&port) {
                Some(config) if reusable.is_none() && config.matches(desired) => {
                    reusable = Some(TunnelPortConfig {
                        node_name: Some(node_name.to_string()),
                        ..config
                    });
                }
                _ => {
                    info!(interface = %port.name, uuid = %port.uuid, "Deleting unknown tunnel port");
                    self.bridge.delete_port(&port.uuid).await?;
                }
            }
        }
        Ok(reusable)
    }

    /// Looks up a port's forwarding handle and excludes the port from flooding.
    async fn configure_port(&self, interface_name: &str) -> Result<u32> {
        let handle = self.bridge.get_port_handle(interface_name).await?;
        if handle == 0 {
            return Err(anyhow!("tunnel port {interface_name} has no forwarding handle"));
        }
        self.bridge.set_no_flood(handle).await?;
        Ok(handle)
    }

    /// Removes whatever was created to reach the node.
    ///
    /// Peer-mesh peers are only removed if the node was installed; tunnel ports are removed
    /// whenever one is cached for the node.
    #[instrument(skip(self), fields(node = %node_name))]
    pub async fn remove_peer(&self, node_name: &str, installed: bool) -> Result<()> {
        if let EncryptionMode::PeerMesh = self.network.encryption {
            if installed {
                self.peer_mesh.delete_peer(node_name).await?;
                debug!("Deleted peer");
            }
            return Ok(());
        }

        let cached = self.ports.lock().get_by_node(node_name).cloned();
        if let Some(port) = cached {
            self.bridge.delete_port(&port.uuid).await?;
            self.ports.lock().remove_node(node_name);
            info!(interface = %port.interface_name, "Deleted tunnel port");
        }
        Ok(())
    }

    /// Deletes the per-node tunnel ports on the bridge that no longer match a known node, and
    /// caches the rest.
    ///
    /// `nodes` maps the names of all known remote nodes to their tunnel addresses. Returns the
    /// number of deleted ports.
    pub async fn remove_stale_ports(&self, nodes: &HashMap<String, DualStackIps>) -> Result<usize> {
        let ports = self.bridge.enumerate_ports().await?;

        let mut stale = Vec::new();
        for port in &ports {
            let Some(config) = TunnelPortConfig::from_port_data(port) else {
                continue;
            };
            let Some(node_name) = config.node_name.as_deref() else {
                continue;
            };
            let wanted = self.network.uses_per_node_ports()
                && nodes
                    .get(node_name)
                    .and_then(DualStackIps::preferred)
                    .is_some_and(|ip| config.matches(&self.desired_port(node_name, ip)));
            if wanted {
                debug!(interface = %config.interface_name, node = %node_name, "Caching tunnel port");
                self.ports.lock().insert(config);
            } else {
                stale.push(config);
            }
        }

        let mut deleted = 0;
        let mut failed = 0;
        for port in stale {
            match self.bridge.delete_port(&port.uuid).await {
                Ok(()) => {
                    info!(interface = %port.interface_name, node = ?port.node_name, "Deleted stale tunnel port");
                    deleted += 1;
                }
                Err(error) => {
                    warn!(%error, interface = %port.interface_name, "Failed to delete stale tunnel port");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(anyhow!("failed to delete {failed} stale tunnel ports"));
        }
        Ok(deleted)
    }

    /// Returns the cached tunnel port for a node.
    pub fn cached_port(&self, node_name: &str) -> Option<TunnelPortConfig> {
        self.ports.lock().get_by_node(node_name).cloned()
    }

    /// Caches a port found on the bridge.
    pub fn prime(&self, port: &PortData) -> bool {
        match TunnelPortConfig::from_port_data(port) {
            Some(config) if config.node_name.is_some() => {
                self.ports.lock().insert(config);
                true
            }
            _ => false,
        }
    }

    fn desired_port(&self, node_name: &str, remote_ip: IpAddr) -> TunnelPortSpec {
        let (psk, remote_name) = match &self.network.encryption {
            EncryptionMode::IpsecPsk { psk } => (Some(psk.clone()), None),
            EncryptionMode::IpsecCert => (None, Some(node_name.to_string())),
            _ => (None, None),
        };
        let interface_type = if self.network.encryption.is_ipsec() {
            INTERFACE_TYPE_IPSEC_TUNNEL
        } else {
            INTERFACE_TYPE_TUNNEL
        };
        TunnelPortSpec {
            name: tunnel_interface_name(node_name),
            tunnel_type: self.network.tunnel_type,
            dst_port: self.network.tunnel_dst_port,
            remote_ip,
            remote_name,
            psk,
            external_ids: BTreeMap::from([
                (EXTERNAL_ID_NODE_NAME.to_string(), node_name.to_string()),
                (EXTERNAL_ID_INTERFACE_TYPE.to_string(), interface_type.to_string()),
            ]),
        }
    }
}

impl fmt::Debug for TunnelPortManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelPortManager")
            .field("network", &self.network)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

// === impl TunnelPortConfig ===

impl TunnelPortConfig {
    /// Parses a port reported by the bridge. Ports without options are not tunnel ports.
    pub fn from_port_data(port: &PortData) -> Option<Self> {
        if port.options.is_empty() {
            return None;
        }
        let tunnel_type = port.if_type.parse().ok()?;
        let option = |key: &str| port.options.get(key).filter(|v| !v.is_empty()).cloned();
        Some(Self {
            node_name: port.node_name().map(Into::into),
            interface_name: port.name.clone(),
            tunnel_type,
            dst_port: option(OPTION_DST_PORT)
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            remote_ip: option(OPTION_REMOTE_IP).and_then(|ip| ip.parse().ok()),
            psk: option(OPTION_PSK),
            remote_name: option(OPTION_REMOTE_NAME),
            uuid: port.uuid.clone(),
            handle: port.handle,
        })
    }

    fn from_spec(spec: &TunnelPortSpec, uuid: String) -> Self {
        Self {
            node_name: spec.node_name().map(Into::into),
            interface_name: spec.name.clone(),
            tunnel_type: spec.tunnel_type,
            dst_port: spec.dst_port,
            remote_ip: Some(spec.remote_ip),
            psk: spec.psk.clone(),
            remote_name: spec.remote_name.clone(),
            uuid,
            handle: 0,
        }
    }

    /// Whether this port can be used as-is for `spec`.
    fn matches(&self, spec: &TunnelPortSpec) -> bool {
        self.interface_name == spec.name
            && self.remote_ip == Some(spec.remote_ip)
            && self.psk == spec.psk
            && self.remote_name == spec.remote_name
    }
}

impl fmt::Debug for TunnelPortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelPortConfig")
            .field("node_name", &self.node_name)
            .field("interface_name", &self.interface_name)
            .field("tunnel_type", &self.tunnel_type)
            .field("dst_port", &self.dst_port)
            .field("remote_ip", &self.remote_ip)
            .field("psk", &self.psk.as_ref().map(|_| "<redacted>"))
            .field("remote_name", &self.remote_name)
            .field("uuid", &self.uuid)
            .field("handle", &self.handle)
            .finish()
    }
}

// === impl TunnelPorts ===

impl TunnelPorts {
    fn get_by_node(&self, node_name: &str) -> Option<&TunnelPortConfig> {
        let interface = self.by_node.get(node_name)?;
        self.by_interface.get(interface)
    }

    fn insert(&mut self, config: TunnelPortConfig) {
        if let Some(node_name) = config.node_name.clone() {
            if let Some(prior) = self.by_node.insert(node_name, config.interface_name.clone()) {
                if prior != config.interface_name {
                    self.by_interface.remove(&prior);
                }
            }
        }
        self.by_interface
            .insert(config.interface_name.clone(), config);
    }

    fn remove_node(&mut self, node_name: &str) -> Option<TunnelPortConfig> {
        let interface = self.by_node.remove(node_name)?;
        self.by_interface.remove(&interface)
    }
}
