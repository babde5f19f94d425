//! A dataplane that records every call made to it.

use crate::core::{
    dataplane::{
        BridgeClient, CertificateReadiness, Dataplane, FlowClient, PeerMeshClient, PeerPodCidr,
        PortData, RouteClient, TunnelPortSpec,
    },
    DualStackIps, IpNet, MacAddr,
};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::Arc,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    InstallFlows {
        node: String,
        pod_cidrs: Vec<IpNet>,
        peer_ips: DualStackIps,
        tunnel_port: u32,
    },
    UninstallFlows(String),
    AddRoutes {
        pod_cidr: IpNet,
        node: String,
        node_ip: Option<IpAddr>,
        gateway: IpAddr,
    },
    DeleteRoutes(IpNet),
    ReconcileRoutes(Vec<IpNet>),
    CreatePort(TunnelPortSpec),
    GetPortHandle(String),
    DeletePort(String),
    SetNoFlood(u32),
    EnumeratePorts,
    UpsertPeer {
        node: String,
        public_key: String,
    },
    DeletePeer(String),
    RemoveStalePeers(BTreeMap<String, String>),
}

#[derive(Debug, Default)]
pub struct Fake {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    ports: Vec<PortData>,
    next_handle: u32,
    next_uuid: u32,
    fail_routes: bool,
    certificates_pending: bool,
}

// === impl Fake ===

impl Fake {
    pub fn dataplane(self: &Arc<Self>) -> Dataplane {
        Dataplane {
            flows: self.clone(),
            routes: self.clone(),
            bridge: self.clone(),
            peer_mesh: self.clone(),
            certificates: self.clone(),
        }
    }

    /// Returns the calls recorded since the last call to `take_calls`.
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state.lock().calls)
    }

    /// Sets the ports reported by the bridge.
    pub fn set_ports(&self, ports: Vec<PortData>) {
        self.state.lock().ports = ports;
    }

    pub fn fail_routes(&self, fail: bool) {
        self.state.lock().fail_routes = fail;
    }

    pub fn certificates_pending(&self, pending: bool) {
        self.state.lock().certificates_pending = pending;
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait::async_trait]
impl FlowClient for Fake {
    async fn install_node_flows(
        &self,
        node_name: &str,
        peer_pod_cidrs: &[PeerPodCidr],
        peer_ips: &DualStackIps,
        tunnel_port: u32,
        _peer_mac: Option<MacAddr>,
    ) -> Result<()> {
        self.record(Call::InstallFlows {
            node: node_name.to_string(),
            pod_cidrs: peer_pod_cidrs.iter().map(|peer| peer.cidr).collect(),
            peer_ips: *peer_ips,
            tunnel_port,
        });
        Ok(())
    }

    async fn uninstall_node_flows(&self, node_name: &str) -> Result<()> {
        self.record(Call::UninstallFlows(node_name.to_string()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl RouteClient for Fake {
    async fn add_routes(
        &self,
        pod_cidr: &IpNet,
        node_name: &str,
        node_ip: Option<IpAddr>,
        gateway: IpAddr,
    ) -> Result<()> {
        if self.state.lock().fail_routes {
            bail!("route table is unavailable");
        }
        self.record(Call::AddRoutes {
            pod_cidr: *pod_cidr,
            node: node_name.to_string(),
            node_ip,
            gateway,
        });
        Ok(())
    }

    async fn delete_routes(&self, pod_cidr: &IpNet) -> Result<()> {
        self.record(Call::DeleteRoutes(*pod_cidr));
        Ok(())
    }

    async fn reconcile(&self, pod_cidrs: &[IpNet]) -> Result<()> {
        self.record(Call::ReconcileRoutes(pod_cidrs.to_vec()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl BridgeClient for Fake {
    async fn create_tunnel_port(&self, spec: &TunnelPortSpec) -> Result<String> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreatePort(spec.clone()));
        state.next_uuid += 1;
        state.next_handle += 1;
        let uuid = format!("uuid-{}", state.next_uuid);
        let mut options = BTreeMap::from([("remote_ip".to_string(), spec.remote_ip.to_string())]);
        if let Some(psk) = spec.psk.clone() {
            options.insert("psk".to_string(), psk);
        }
        if let Some(remote_name) = spec.remote_name.clone() {
            options.insert("remote_name".to_string(), remote_name);
        }
        let port = PortData {
            uuid: uuid.clone(),
            name: spec.name.clone(),
            if_type: spec.tunnel_type.to_string(),
            options,
            external_ids: spec.external_ids.clone(),
            handle: state.next_handle,
        };
        state.ports.push(port);
        Ok(uuid)
    }

    async fn get_port_handle(&self, name: &str) -> Result<u32> {
        let mut state = self.state.lock();
        state.calls.push(Call::GetPortHandle(name.to_string()));
        let port = state.ports.iter().find(|port| port.name == name);
        Ok(port.map_or(0, |port| port.handle))
    }

    async fn delete_port(&self, uuid: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::DeletePort(uuid.to_string()));
        state.ports.retain(|port| port.uuid != uuid);
        Ok(())
    }

    async fn set_no_flood(&self, handle: u32) -> Result<()> {
        self.record(Call::SetNoFlood(handle));
        Ok(())
    }

    async fn enumerate_ports(&self) -> Result<Vec<PortData>> {
        let mut state = self.state.lock();
        state.calls.push(Call::EnumeratePorts);
        Ok(state.ports.clone())
    }
}

#[async_trait::async_trait]
impl PeerMeshClient for Fake {
    async fn upsert_peer(
        &self,
        node_name: &str,
        public_key: &str,
        _endpoint: &DualStackIps,
    ) -> Result<()> {
        self.record(Call::UpsertPeer {
            node: node_name.to_string(),
            public_key: public_key.to_string(),
        });
        Ok(())
    }

    async fn delete_peer(&self, node_name: &str) -> Result<()> {
        self.record(Call::DeletePeer(node_name.to_string()));
        Ok(())
    }

    async fn remove_stale_peers(&self, expected: &HashMap<String, String>) -> Result<()> {
        self.record(Call::RemoveStalePeers(
            expected
                .iter()
                .map(|(node, key)| (node.clone(), key.clone()))
                .collect(),
        ));
        Ok(())
    }
}

impl CertificateReadiness for Fake {
    fn has_synced(&self) -> bool {
        !self.state.lock().certificates_pending
    }
}
