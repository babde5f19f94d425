use crate::{
    core::{EncapMode, EncryptionMode, NetworkConfig, NodeConfig, TunnelType},
    index::{metrics::IndexMetrics, NodeIndex, WorkQueue},
    k8s::{self, Api},
    Controller, ControllerMetrics, DryRun,
};
use anyhow::{anyhow, bail, Context, Error, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{fmt, str::FromStr};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "node-route-controller",
    about = "Programs routes to the pod networks of remote nodes"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "noderoute=info,warn",
        env = "NODE_ROUTE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the node this controller runs on.
    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    /// One of `encap`, `noEncap`, or `networkPolicyOnly`.
    #[clap(long, default_value = "encap")]
    encap_mode: EncapMode,

    #[clap(long, default_value = "geneve")]
    tunnel_type: TunnelType,

    /// The tunnel's UDP destination port. Zero selects the tunnel type's default.
    #[clap(long, default_value = "0")]
    tunnel_port: u16,

    /// One of `none`, `ipsec`, or `wireguard`.
    #[clap(long, default_value = "none")]
    encryption: Encryption,

    /// How IPsec peers are authenticated: `psk` or `cert`.
    #[clap(long, default_value = "psk")]
    ipsec_auth: IpsecAuth,

    #[clap(long, env = "NODE_ROUTE_CONTROLLER_IPSEC_PSK", hide_env_values = true)]
    ipsec_psk: Option<Psk>,

    /// Creates a dedicated tunnel port for each remote node, even without IPsec.
    #[clap(long)]
    per_peer_tunnel_ports: bool,

    /// The number of nodes reconciled concurrently.
    #[clap(long, default_value = "4")]
    workers: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Encryption {
    None,
    Ipsec,
    WireGuard,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IpsecAuth {
    Psk,
    Cert,
}

/// An IPsec pre-shared key, which is never printed.
#[derive(Clone)]
struct Psk(String);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            node_name,
            encap_mode,
            tunnel_type,
            tunnel_port,
            encryption,
            ipsec_auth,
            ipsec_psk,
            per_peer_tunnel_ports,
            workers,
        } = self;

        let network = NetworkConfig {
            encap_mode,
            tunnel_type,
            tunnel_dst_port: tunnel_port,
            encryption: encryption_mode(encap_mode, encryption, ipsec_auth, ipsec_psk)?,
            per_peer_tunnel_ports,
        };
        network.validate()?;

        let queue = WorkQueue::default();
        let (nodes, initial_list) = NodeIndex::shared(node_name.clone(), queue.clone());

        let mut prom = <Registry>::default();
        let metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("node_route_controller"));
        let node_index =
            IndexMetrics::register(nodes.clone(), prom.sub_registry_with_prefix("node_index"))
                .shared();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // The local node's pod CIDRs fix the mask length of every pod CIDR in the cluster.
        let local = Api::<k8s::Node>::all(runtime.client())
            .get(&node_name)
            .await
            .with_context(|| format!("failed to fetch local node {node_name}"))?;
        let pod_cidrs = k8s::node_view(&local)
            .with_context(|| format!("invalid local node {node_name}"))?
            .pod_cidrs;
        if pod_cidrs.is_empty() && encap_mode.needs_per_node_dataplane() {
            warn!(node = %node_name, "Local node has no pod CIDRs");
        }
        info!(node = %node_name, ?pod_cidrs, mode = %encap_mode, encryption = ?network.encryption, "Starting");
        let node = NodeConfig {
            name: node_name,
            pod_cidrs,
        };

        let node_events = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(node_index, node_events).instrument(info_span!("nodes")),
        );

        let controller = Controller::new(
            node,
            network,
            nodes,
            queue,
            DryRun::dataplane(),
            metrics,
        );
        tokio::spawn(
            controller
                .run(initial_list, workers, runtime.shutdown_handle())
                .instrument(info_span!("controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn encryption_mode(
    encap_mode: EncapMode,
    encryption: Encryption,
    auth: IpsecAuth,
    psk: Option<Psk>,
) -> Result<EncryptionMode> {
    match (encryption, auth) {
        (Encryption::None, _) if encap_mode == EncapMode::NoEncap => Ok(EncryptionMode::None),
        (Encryption::None, _) => Ok(EncryptionMode::Overlay),
        (Encryption::WireGuard, _) => Ok(EncryptionMode::PeerMesh),
        (Encryption::Ipsec, IpsecAuth::Cert) => Ok(EncryptionMode::IpsecCert),
        (Encryption::Ipsec, IpsecAuth::Psk) => {
            let Psk(psk) = psk.ok_or_else(|| anyhow!("--ipsec-psk must be set for IPsec"))?;
            Ok(EncryptionMode::IpsecPsk { psk })
        }
    }
}

// === impl Encryption ===

impl FromStr for Encryption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "ipsec" => Ok(Self::Ipsec),
            "wireguard" => Ok(Self::WireGuard),
            s => Err(anyhow!("invalid encryption mode: {:?}", s)),
        }
    }
}

// === impl IpsecAuth ===

impl FromStr for IpsecAuth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "psk" => Ok(Self::Psk),
            "cert" => Ok(Self::Cert),
            s => Err(anyhow!("invalid IPsec authentication mode: {:?}", s)),
        }
    }
}

// === impl Psk ===

impl FromStr for Psk {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("pre-shared key must not be empty");
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Psk(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let args = Args::try_parse_from(["node-route-controller", "--node-name", "node-a"])
            .expect("args must parse");
        assert_eq!(args.node_name, "node-a");
        assert_eq!(args.encap_mode, EncapMode::Encap);
        assert_eq!(args.encryption, Encryption::None);
        assert_eq!(args.workers, 4);
    }

    #[test]
    fn selects_encryption_mode() {
        assert_eq!(
            encryption_mode(EncapMode::NoEncap, Encryption::None, IpsecAuth::Psk, None).unwrap(),
            EncryptionMode::None
        );
        assert_eq!(
            encryption_mode(EncapMode::Encap, Encryption::None, IpsecAuth::Psk, None).unwrap(),
            EncryptionMode::Overlay
        );
        assert_eq!(
            encryption_mode(
                EncapMode::Encap,
                Encryption::Ipsec,
                IpsecAuth::Psk,
                Some(Psk("changeme".to_string()))
            )
            .unwrap(),
            EncryptionMode::IpsecPsk {
                psk: "changeme".to_string()
            }
        );
        assert!(
            encryption_mode(EncapMode::Encap, Encryption::Ipsec, IpsecAuth::Psk, None).is_err()
        );
        assert_eq!(
            encryption_mode(EncapMode::Encap, Encryption::Ipsec, IpsecAuth::Cert, None).unwrap(),
            EncryptionMode::IpsecCert
        );
        assert_eq!(
            encryption_mode(EncapMode::NoEncap, Encryption::WireGuard, IpsecAuth::Psk, None)
                .unwrap(),
            EncryptionMode::PeerMesh
        );
    }

    #[test]
    fn psk_is_not_printed() {
        let args = Args::try_parse_from([
            "node-route-controller",
            "--node-name",
            "node-a",
            "--encryption",
            "ipsec",
            "--ipsec-psk",
            "changeme",
        ])
        .expect("args must parse");
        assert!(!format!("{args:?}").contains("changeme"));
    }
}
