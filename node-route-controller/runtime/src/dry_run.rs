//! A dataplane that logs the operations it is asked to perform instead of performing them.
//!
//! State is kept in memory so that enumeration and reconciliation behave as they would against a
//! real backend for the lifetime of the process.

use crate::core::{
    dataplane::{
        BridgeClient, CertificateReadiness, Dataplane, FlowClient, PeerMeshClient, PeerPodCidr,
        PortData, RouteClient, TunnelPortSpec,
    },
    DualStackIps, IpNet, MacAddr,
};
use ahash::AHashMap;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::Arc,
};
use tracing::info;

#[derive(Debug, Default)]
pub struct DryRun {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    flows: AHashMap<String, Vec<PeerPodCidr>>,
    routes: BTreeMap<IpNet, (String, Option<IpAddr>, IpAddr)>,
    ports: BTreeMap<String, PortData>,
    peers: AHashMap<String, String>,
    next_handle: u32,
    next_uuid: u64,
}

// === impl DryRun ===

impl DryRun {
    pub fn dataplane() -> Dataplane {
        let dry_run = Arc::new(Self::default());
        Dataplane {
            flows: dry_run.clone(),
            routes: dry_run.clone(),
            bridge: dry_run.clone(),
            peer_mesh: dry_run.clone(),
            certificates: dry_run,
        }
    }
}

#[async_trait::async_trait]
impl FlowClient for DryRun {
    async fn install_node_flows(
        &self,
        node_name: &str,
        peer_pod_cidrs: &[PeerPodCidr],
        peer_ips: &DualStackIps,
        tunnel_port: u32,
        peer_mac: Option<MacAddr>,
    ) -> Result<()> {
        info!(
            node = %node_name,
            ?peer_pod_cidrs,
            peer_ips = ?peer_ips.iter().collect::<Vec<_>>(),
            tunnel_port,
            peer_mac = ?peer_mac.map(|mac| mac.to_string()),
            "Installing node flows"
        );
        self.state
            .lock()
            .flows
            .insert(node_name.to_string(), peer_pod_cidrs.to_vec());
        Ok(())
    }

    async fn uninstall_node_flows(&self, node_name: &str) -> Result<()> {
        info!(node = %node_name, "Uninstalling node flows");
        self.state.lock().flows.remove(node_name);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RouteClient for DryRun {
    async fn add_routes(
        &self,
        pod_cidr: &IpNet,
        node_name: &str,
        node_ip: Option<IpAddr>,
        gateway: IpAddr,
    ) -> Result<()> {
        info!(%pod_cidr, node = %node_name, ?node_ip, %gateway, "Adding routes");
        self.state
            .lock()
            .routes
            .insert(*pod_cidr, (node_name.to_string(), node_ip, gateway));
        Ok(())
    }

    async fn delete_routes(&self, pod_cidr: &IpNet) -> Result<()> {
        info!(%pod_cidr, "Deleting routes");
        self.state.lock().routes.remove(pod_cidr);
        Ok(())
    }

    async fn reconcile(&self, pod_cidrs: &[IpNet]) -> Result<()> {
        let mut state = self.state.lock();
        let stale = state
            .routes
            .keys()
            .filter(|cidr| !pod_cidrs.contains(cidr))
            .copied()
            .collect::<Vec<_>>();
        for cidr in stale {
            info!(pod_cidr = %cidr, "Deleting stale routes");
            state.routes.remove(&cidr);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BridgeClient for DryRun {
    async fn create_tunnel_port(&self, spec: &TunnelPortSpec) -> Result<String> {
        let mut state = self.state.lock();
        if state.ports.contains_key(&spec.name) {
            bail!("port {} already exists", spec.name);
        }
        state.next_uuid += 1;
        let uuid = format!("{:08x}-0000-0000-0000-000000000000", state.next_uuid);
        info!(?spec, %uuid, "Creating tunnel port");

        let mut options = BTreeMap::new();
        options.insert("remote_ip".to_string(), spec.remote_ip.to_string());
        if spec.dst_port != 0 {
            options.insert("dst_port".to_string(), spec.dst_port.to_string());
        }
        if let Some(psk) = spec.psk.clone() {
            options.insert("psk".to_string(), psk);
        }
        if let Some(remote_name) = spec.remote_name.clone() {
            options.insert("remote_name".to_string(), remote_name);
        }
        state.ports.insert(
            spec.name.clone(),
            PortData {
                uuid: uuid.clone(),
                name: spec.name.clone(),
                if_type: spec.tunnel_type.to_string(),
                options,
                external_ids: spec.external_ids.clone(),
                handle: 0,
            },
        );
        Ok(uuid)
    }

    async fn get_port_handle(&self, name: &str) -> Result<u32> {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let next = state.next_handle;
        let Some(port) = state.ports.get_mut(name) else {
            bail!("port {name} not found");
        };
        if port.handle == 0 {
            port.handle = next;
        }
        Ok(port.handle)
    }

    async fn delete_port(&self, uuid: &str) -> Result<()> {
        info!(%uuid, "Deleting port");
        self.state.lock().ports.retain(|_, port| port.uuid != uuid);
        Ok(())
    }

    async fn set_no_flood(&self, handle: u32) -> Result<()> {
        info!(handle, "Disabling flooding");
        Ok(())
    }

    async fn enumerate_ports(&self) -> Result<Vec<PortData>> {
        Ok(self.state.lock().ports.values().cloned().collect())
    }
}

#[async_trait::async_trait]
impl PeerMeshClient for DryRun {
    async fn upsert_peer(
        &self,
        node_name: &str,
        public_key: &str,
        endpoint: &DualStackIps,
    ) -> Result<()> {
        info!(node = %node_name, endpoint = ?endpoint.preferred(), "Updating peer");
        self.state
            .lock()
            .peers
            .insert(node_name.to_string(), public_key.to_string());
        Ok(())
    }

    async fn delete_peer(&self, node_name: &str) -> Result<()> {
        info!(node = %node_name, "Deleting peer");
        self.state.lock().peers.remove(node_name);
        Ok(())
    }

    async fn remove_stale_peers(&self, expected: &HashMap<String, String>) -> Result<()> {
        self.state.lock().peers.retain(|node_name, key| {
            let keep = expected.get(node_name) == Some(&*key);
            if !keep {
                info!(node = %node_name, "Deleting stale peer");
            }
            keep
        });
        Ok(())
    }
}

impl CertificateReadiness for DryRun {
    fn has_synced(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TunnelType;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn ports_round_trip_through_the_bridge() {
        let dry_run = DryRun::default();
        let spec = TunnelPortSpec {
            name: "node-1-0a1b2c3d".to_string(),
            tunnel_type: TunnelType::Gre,
            dst_port: 0,
            remote_ip: "10.0.0.2".parse().unwrap(),
            remote_name: None,
            psk: Some("changeme".to_string()),
            external_ids: Default::default(),
        };
        let uuid = dry_run.create_tunnel_port(&spec).await.unwrap();
        assert!(dry_run.create_tunnel_port(&spec).await.is_err());

        let handle = dry_run.get_port_handle(&spec.name).await.unwrap();
        assert_ne!(handle, 0);
        assert_eq!(dry_run.get_port_handle(&spec.name).await.unwrap(), handle);

        let ports = dry_run.enumerate_ports().await.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].uuid, uuid);
        assert_eq!(ports[0].if_type, "gre");
        assert_eq!(ports[0].options.get("psk").map(String::as_str), Some("changeme"));

        dry_run.delete_port(&uuid).await.unwrap();
        assert!(dry_run.enumerate_ports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_removes_unknown_routes() {
        let dry_run = DryRun::default();
        let gw = "10.1.0.1".parse().unwrap();
        for cidr in ["10.1.0.0/24", "10.2.0.0/24"] {
            dry_run
                .add_routes(&cidr.parse().unwrap(), "node", None, gw)
                .await
                .unwrap();
        }
        dry_run
            .reconcile(&["10.1.0.0/24".parse().unwrap()])
            .await
            .unwrap();
        let routes = dry_run.state.lock().routes.keys().copied().collect::<Vec<_>>();
        assert_eq!(routes, vec!["10.1.0.0/24".parse::<IpNet>().unwrap()]);
    }
}
