//! Error types for the nativeguard tunnel engine

use thiserror::Error;

/// Main error type for nativeguard
#[derive(Error, Debug)]
pub enum NativeGuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel state machine errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Configuration errors. Every variant is reported as `INVALID_CONFIG`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing '{field}'")]
    MissingField { field: String },

    #[error("Invalid '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("DH computation produced a low-order result")]
    DiffieHellman,
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Handshake timeout after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Stale handshake initiation timestamp")]
    StaleTimestamp,

    #[error("Unknown peer static key")]
    UnknownPeer,

    #[error("Invalid receiver index: {index}")]
    InvalidReceiverIndex { index: u32 },

    #[error("Replay attack detected: counter {counter} already seen")]
    ReplayDetected { counter: u64 },

    #[error("Packet authentication failed for counter {counter}")]
    AuthFailed { counter: u64 },

    #[error("Send counter exhausted, session must be rotated")]
    CounterExhausted,

    #[error("Session expired")]
    SessionExpired,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("DNS resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },
}

/// Tunnel state machine errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel already active (state: {state})")]
    AlreadyConnected { state: String },

    #[error("Tunnel is not connected")]
    NotConnected,

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Raw packet I/O is not available on this platform: {reason}")]
    Unsupported { reason: String },
}

/// Coarse error classification reported to the embedding application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfig,
    HandshakeFailed,
    AlreadyConnected,
    NotConnected,
    CounterExhausted,
    ReplayDetected,
    AuthFailed,
    Cancelled,
    Unsupported,
    Network,
    Internal,
}

impl ErrorKind {
    /// Machine-readable code in the bridge's `SCREAMING_CASE` convention
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::HandshakeFailed => "HANDSHAKE_FAILED",
            Self::AlreadyConnected => "ALREADY_CONNECTED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::CounterExhausted => "COUNTER_EXHAUSTED",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Network => "NETWORK_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl NativeGuardError {
    /// Classify this error into the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::InvalidConfig,
            Self::Protocol(ProtocolError::ReplayDetected { .. }) => ErrorKind::ReplayDetected,
            Self::Protocol(ProtocolError::AuthFailed { .. }) => ErrorKind::AuthFailed,
            Self::Protocol(ProtocolError::CounterExhausted) => ErrorKind::CounterExhausted,
            Self::Protocol(ProtocolError::SessionExpired) => ErrorKind::NotConnected,
            Self::Protocol(ProtocolError::InvalidReceiverIndex { .. }) => ErrorKind::AuthFailed,
            Self::Protocol(_) => ErrorKind::HandshakeFailed,
            Self::Crypto(_) => ErrorKind::HandshakeFailed,
            Self::Network(_) => ErrorKind::Network,
            Self::Tunnel(TunnelError::AlreadyConnected { .. }) => ErrorKind::AlreadyConnected,
            Self::Tunnel(TunnelError::NotConnected) => ErrorKind::NotConnected,
            Self::Tunnel(TunnelError::Cancelled) => ErrorKind::Cancelled,
            Self::Tunnel(TunnelError::Unsupported { .. }) => ErrorKind::Unsupported,
        }
    }

    /// Shorthand for `self.kind().code()`
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Wrap a handshake-stage failure so callers always see `HANDSHAKE_FAILED`
    pub(crate) fn handshake(reason: impl std::fmt::Display) -> Self {
        ProtocolError::HandshakeFailed {
            reason: reason.to_string(),
        }
        .into()
    }

    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Protocol(ProtocolError::HandshakeTimeout { seconds }) => {
                format!(
                    "Handshake timed out after {}s.\n  \
                    Check network connectivity and firewall rules for the server's UDP port.",
                    seconds
                )
            }

            Self::Protocol(ProtocolError::MacVerificationFailed) => {
                "MAC verification failed. The peer's public key may be incorrect.".to_string()
            }

            Self::Tunnel(TunnelError::AlreadyConnected { .. }) => {
                "A tunnel is already active. Disconnect before connecting again.".to_string()
            }

            Self::Tunnel(TunnelError::Unsupported { .. }) => {
                #[cfg(target_os = "linux")]
                return "Raw packet I/O unavailable. Check /dev/net/tun and CAP_NET_ADMIN."
                    .to_string();
                #[cfg(not(target_os = "linux"))]
                return format!("{}", self);
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable without caller intervention
    pub fn is_recoverable(&self) -> bool {
        match self.kind() {
            // Per-packet failures never tear the session down on their own
            ErrorKind::ReplayDetected | ErrorKind::AuthFailed | ErrorKind::Network => true,
            ErrorKind::CounterExhausted => true,

            ErrorKind::InvalidConfig
            | ErrorKind::HandshakeFailed
            | ErrorKind::AlreadyConnected
            | ErrorKind::NotConnected
            | ErrorKind::Cancelled
            | ErrorKind::Unsupported
            | ErrorKind::Internal => false,
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Tunnel(TunnelError::Unsupported { .. }) => 2,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::Tunnel(_) => 6,
        }
    }
}

/// Result type alias for nativeguard operations
pub type Result<T> = std::result::Result<T, NativeGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_message_matches_bridge() {
        let err: NativeGuardError = ConfigError::MissingField {
            field: "serverPort".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(err.to_string().ends_with("Missing 'serverPort'"));
    }

    #[test]
    fn test_per_packet_errors_are_recoverable() {
        let replay: NativeGuardError = ProtocolError::ReplayDetected { counter: 7 }.into();
        let auth: NativeGuardError = ProtocolError::AuthFailed { counter: 7 }.into();
        assert_eq!(replay.kind(), ErrorKind::ReplayDetected);
        assert_eq!(auth.kind(), ErrorKind::AuthFailed);
        assert!(replay.is_recoverable());
        assert!(auth.is_recoverable());
    }

    #[test]
    fn test_handshake_errors_collapse_to_handshake_failed() {
        let timeout: NativeGuardError = ProtocolError::HandshakeTimeout { seconds: 5 }.into();
        let mac: NativeGuardError = ProtocolError::MacVerificationFailed.into();
        let crypto: NativeGuardError = CryptoError::Decryption.into();
        for err in [timeout, mac, crypto] {
            assert_eq!(err.code(), "HANDSHAKE_FAILED");
            assert!(!err.is_recoverable());
        }
    }

    #[test]
    fn test_already_connected() {
        let err: NativeGuardError = TunnelError::AlreadyConnected {
            state: "connected".to_string(),
        }
        .into();
        assert_eq!(err.code(), "ALREADY_CONNECTED");
        assert_eq!(err.exit_code(), 6);
    }
}
