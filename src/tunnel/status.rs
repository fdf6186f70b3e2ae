//! Tunnel lifecycle states as reported to the embedding application

use std::fmt;

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// A handshake or protocol failure; `disconnect` is required before retrying
    Faulted,
}

impl TunnelStatus {
    /// Status string used by the bridge (`getStatus`)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Faulted => "error",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
