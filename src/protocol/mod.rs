//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2), initiator and responder
//! - TAI64N timestamps and replay windows
//! - Transport encryption
//! - Session state and rotation policy

pub mod handshake;
pub mod messages;
pub mod replay;
pub mod responder;
pub mod session;
pub mod timestamp;
pub mod transport;

pub use handshake::{HandshakeEngine, HandshakeTranscript, SessionKeys};
pub use messages::{HandshakeInitiation, HandshakeResponse, MessageType, TransportHeader};
pub use replay::ReplayWindow;
pub use responder::{PendingResponse, Responder};
pub use session::{PeerConfig, SessionPhase, SessionState};
pub use transport::TransportKeys;
