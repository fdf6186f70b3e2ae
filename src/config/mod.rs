//! Tunnel configuration
//!
//! The embedding application hands us a loosely-typed map (JSON). It is
//! validated once, here, into a [`TunnelConfig`]; nothing past this module
//! sees the raw map. Standard WireGuard `.conf` text can be imported and
//! exported for interoperability with other clients.

mod bridge;
mod conf_file;
mod settings;

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use zeroize::Zeroizing;

use crate::error::ConfigError;

pub use settings::TunnelSettings;

/// MTU used when the caller does not supply one
pub const DEFAULT_MTU: u16 = 1420;

/// Validated tunnel configuration. Keys are still in their base64 text form;
/// [`crate::keys::KeyMaterial::load`] decodes and checks them.
#[derive(Clone)]
pub struct TunnelConfig {
    /// Our base64 private key
    pub private_key: Zeroizing<String>,
    /// The server's base64 public key
    pub public_key: String,
    /// Server host name or IP literal
    pub server_address: String,
    /// Server UDP port
    pub server_port: u16,
    /// Routes sent through the tunnel, deduplicated in first-seen order
    pub allowed_ips: Vec<IpNet>,
    /// Resolvers to use while connected
    pub dns: Vec<IpAddr>,
    /// Tunnel MTU
    pub mtu: u16,
    /// Optional base64 preshared key
    pub preshared_key: Option<Zeroizing<String>>,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("server_address", &self.server_address)
            .field("server_port", &self.server_port)
            .field("allowed_ips", &self.allowed_ips)
            .field("dns", &self.dns)
            .field("mtu", &self.mtu)
            .field("preshared_key", &self.preshared_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TunnelConfig {
    /// Validate a bridge-style config map
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        bridge::parse_map(value)
    }

    /// Validate a JSON document holding a bridge-style config map
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError {
                line: e.line(),
                message: e.to_string(),
            })?;
        Self::from_value(&value)
    }

    /// Load a config file. `.conf` files are read as WireGuard INI, anything
    /// else as a JSON map.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("conf") => Self::from_conf(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Parse standard WireGuard `.conf` text with one `[Peer]`
    pub fn from_conf(content: &str) -> Result<Self, ConfigError> {
        conf_file::parse(content)
    }

    /// Render as standard WireGuard `.conf` text
    pub fn to_conf(&self) -> String {
        conf_file::render(self)
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        match self.server_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.server_port),
            _ => format!("{}:{}", self.server_address, self.server_port),
        }
    }
}

/// Push `net` unless an equal range is already present
pub(crate) fn push_unique(nets: &mut Vec<IpNet>, net: IpNet) {
    if !nets.contains(&net) {
        nets.push(net);
    }
}

/// Accept `a.b.c.d/n` or a bare address (host route)
pub(crate) fn parse_cidr(value: &str) -> Result<IpNet, ConfigError> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| ConfigError::InvalidCidr {
            value: value.to_string(),
        })
}

pub(crate) fn parse_ip(value: &str) -> Result<IpAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidAddress {
            value: value.to_string(),
        })
}
