//! Core types for the node route controller.
//!
//! A node route controller runs on every node of the cluster. It watches the cluster's `Node`
//! resources and, for every remote node, drives the local dataplane so that the remote node's pod
//! CIDRs are reachable:
//!
//! - forwarding flows are installed in the flow table,
//! - a host route to each remote pod CIDR is added via the remote node's address, and
//! - depending on the configured encryption mode, a per-node IPsec tunnel port or a WireGuard peer
//!   is maintained.
//!
//! This crate holds the types shared by the indexing and runtime crates: the typed view of a
//! node, the network configuration, and the interfaces of the dataplane backends.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod dataplane;
mod mac;
mod node;

pub use self::{
    config::{EncapMode, EncryptionMode, NetworkConfig, NodeConfig, TunnelType},
    mac::{InvalidMac, MacAddr},
    node::{gateway_ip, tunnel_interface_name, DualStackIps, NodeView, PeerIdentity},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
