use anyhow::{anyhow, bail, Error, Result};
use ipnet::IpNet;
use std::{fmt, str::FromStr};

/// How pod traffic between nodes is carried.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum EncapMode {
    /// Pod traffic to remote nodes is encapsulated in an overlay tunnel.
    #[default]
    Encap,

    /// Pod traffic is routed directly to remote nodes.
    NoEncap,

    /// Another component owns pod connectivity: no per-node routes, flows, or tunnels are
    /// programmed at all.
    NetworkPolicyOnly,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TunnelType {
    #[default]
    Vxlan,
    Geneve,
    Gre,
    Stt,
}

/// The mechanism used to reach (and, optionally, encrypt traffic to) remote nodes.
///
/// Modes are mutually exclusive and fixed for the lifetime of the process.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Unencrypted, unencapsulated routing.
    None,

    /// Unencrypted overlay tunnels.
    #[default]
    Overlay,

    /// IPsec tunnels authenticated with a pre-shared key.
    IpsecPsk { psk: String },

    /// IPsec tunnels authenticated with certificates whose subject is the peer's node name.
    IpsecCert,

    /// A WireGuard peer mesh, keyed by each node's public key.
    PeerMesh,
}

#[derive(Clone, Debug, Default)]
pub struct NetworkConfig {
    pub encap_mode: EncapMode,
    pub tunnel_type: TunnelType,

    /// The tunnel's UDP destination port. Zero selects the tunnel type's default.
    pub tunnel_dst_port: u16,

    pub encryption: EncryptionMode,

    /// Whether unencrypted overlay traffic needs a dedicated tunnel port per peer rather than
    /// the shared tunnel port.
    pub per_peer_tunnel_ports: bool,
}

/// Describes the local node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,

    /// The local node's pod CIDRs. These fix the mask length of pod CIDRs in each IP family.
    pub pod_cidrs: Vec<IpNet>,
}

// === impl EncapMode ===

impl EncapMode {
    /// Whether routes, flows, and tunnels must be programmed for each remote node.
    pub fn needs_per_node_dataplane(self) -> bool {
        !matches!(self, Self::NetworkPolicyOnly)
    }
}

impl FromStr for EncapMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "encap" => Ok(Self::Encap),
            "noencap" => Ok(Self::NoEncap),
            "networkpolicyonly" => Ok(Self::NetworkPolicyOnly),
            _ => Err(anyhow!("invalid encapsulation mode: {:?}", s)),
        }
    }
}

impl fmt::Display for EncapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encap => "encap".fmt(f),
            Self::NoEncap => "noEncap".fmt(f),
            Self::NetworkPolicyOnly => "networkPolicyOnly".fmt(f),
        }
    }
}

// === impl TunnelType ===

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vxlan => "vxlan",
            Self::Geneve => "geneve",
            Self::Gre => "gre",
            Self::Stt => "stt",
        }
    }
}

impl FromStr for TunnelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vxlan" => Ok(Self::Vxlan),
            "geneve" => Ok(Self::Geneve),
            "gre" => Ok(Self::Gre),
            "stt" => Ok(Self::Stt),
            s => Err(anyhow!("invalid tunnel type: {:?}", s)),
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl EncryptionMode ===

impl EncryptionMode {
    pub fn is_ipsec(&self) -> bool {
        matches!(self, Self::IpsecPsk { .. } | Self::IpsecCert)
    }
}

// The pre-shared key must never end up in logs.
impl fmt::Debug for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Overlay => f.write_str("Overlay"),
            Self::IpsecPsk { .. } => f.debug_struct("IpsecPsk").finish_non_exhaustive(),
            Self::IpsecCert => f.write_str("IpsecCert"),
            Self::PeerMesh => f.write_str("PeerMesh"),
        }
    }
}

// === impl NetworkConfig ===

impl NetworkConfig {
    /// Checks that the encryption mode can be used with the encapsulation mode.
    pub fn validate(&self) -> Result<()> {
        match (&self.encryption, self.encap_mode) {
            (EncryptionMode::IpsecPsk { psk }, _) if psk.is_empty() => {
                bail!("IPsec pre-shared key must not be empty")
            }
            (mode, EncapMode::NoEncap) if mode.is_ipsec() => {
                bail!("IPsec encryption requires the encap mode")
            }
            (EncryptionMode::Overlay, EncapMode::NoEncap) => {
                bail!("overlay tunnels require the encap mode")
            }
            _ => Ok(()),
        }
    }

    /// Whether each remote node gets its own tunnel port.
    pub fn uses_per_node_ports(&self) -> bool {
        match self.encryption {
            EncryptionMode::IpsecPsk { .. } | EncryptionMode::IpsecCert => true,
            EncryptionMode::Overlay => self.per_peer_tunnel_ports,
            EncryptionMode::None | EncryptionMode::PeerMesh => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn psk_is_redacted() {
        let mode = EncryptionMode::IpsecPsk {
            psk: "changeme".to_string(),
        };
        assert!(!format!("{mode:?}").contains("changeme"));
    }

    #[test]
    fn validates_encryption_against_encap_mode() {
        let ipsec_noencap = NetworkConfig {
            encap_mode: EncapMode::NoEncap,
            encryption: EncryptionMode::IpsecCert,
            ..Default::default()
        };
        assert!(ipsec_noencap.validate().is_err());

        let wireguard_noencap = NetworkConfig {
            encap_mode: EncapMode::NoEncap,
            encryption: EncryptionMode::PeerMesh,
            ..Default::default()
        };
        assert!(wireguard_noencap.validate().is_ok());

        let empty_psk = NetworkConfig {
            encryption: EncryptionMode::IpsecPsk { psk: String::new() },
            ..Default::default()
        };
        assert!(empty_psk.validate().is_err());
    }

    #[test]
    fn parses_modes() {
        assert_eq!(
            "networkPolicyOnly".parse::<EncapMode>().unwrap(),
            EncapMode::NetworkPolicyOnly
        );
        assert_eq!("noEncap".parse::<EncapMode>().unwrap(), EncapMode::NoEncap);
        assert!("hybrid".parse::<EncapMode>().is_err());
        assert_eq!("geneve".parse::<TunnelType>().unwrap(), TunnelType::Geneve);
    }
}
