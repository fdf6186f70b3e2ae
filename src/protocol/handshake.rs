//! Initiator side of the WireGuard handshake
//!
//! Implements the Noise IKpsk2 pattern:
//!
//! ```text
//! initiator -> responder: e, es, s, ss, {timestamp}
//! responder -> initiator: e, ee, se, psk, {}
//! ```

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::messages::{HandshakeInitiation, HandshakeResponse};
use super::timestamp::TimestampClock;
use crate::crypto::noise::{self, SymmetricState};
use crate::crypto::random::SecureRandom;
use crate::crypto::x25519;
use crate::error::{NativeGuardError, ProtocolError, Result};
use crate::keys::{Identity, PeerKey};

/// Symmetric keys produced by a completed handshake
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Index the peer puts in packets addressed to us
    #[zeroize(skip)]
    pub local_index: u32,
    /// Index we put in packets addressed to the peer
    #[zeroize(skip)]
    pub remote_index: u32,
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .finish_non_exhaustive()
    }
}

/// Initiator state between sending the initiation and receiving the
/// response. Every secret in here is wiped when it is dropped, whether the
/// handshake completed, failed or was abandoned.
pub struct HandshakeTranscript {
    identity: Identity,
    peer_static: [u8; 32],
    psk: Zeroizing<[u8; 32]>,
    ephemeral_private: Zeroizing<[u8; 32]>,
    state: SymmetricState,
    sender_index: u32,
}

impl HandshakeTranscript {
    /// Index we chose for this session; the response must echo it
    pub fn sender_index(&self) -> u32 {
        self.sender_index
    }
}

impl fmt::Debug for HandshakeTranscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeTranscript")
            .field("sender_index", &self.sender_index)
            .finish_non_exhaustive()
    }
}

/// Drives initiator handshakes. Owns the timestamp clock so successive
/// initiations from one engine are always ordered.
#[derive(Debug, Default)]
pub struct HandshakeEngine {
    clock: TimestampClock,
}

impl HandshakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a handshake initiation for `peer`
    pub fn begin_handshake(
        &self,
        identity: &Identity,
        peer: &PeerKey,
        random: &dyn SecureRandom,
    ) -> Result<(HandshakeTranscript, HandshakeInitiation)> {
        let sender_index = random.next_u32().map_err(NativeGuardError::handshake)?;
        let mut ephemeral_private = Zeroizing::new([0u8; 32]);
        random
            .try_fill(&mut ephemeral_private[..])
            .map_err(NativeGuardError::handshake)?;
        let ephemeral_public = x25519::public_key(&ephemeral_private);

        let peer_static = peer.public_key;
        let mut state = SymmetricState::new(&peer_static);

        // e
        state.mix_ephemeral(&ephemeral_public);

        // es
        let shared = x25519::dh(&ephemeral_private, &peer_static).map_err(NativeGuardError::handshake)?;
        let key = Zeroizing::new(state.mix_key(&shared[..]));

        // s
        let encrypted_static = state.encrypt_and_hash(&key, identity.public_key())?;

        // ss
        let shared =
            x25519::dh(identity.private_key(), &peer_static).map_err(NativeGuardError::handshake)?;
        let key = Zeroizing::new(state.mix_key(&shared[..]));

        // {timestamp}
        let timestamp = self.clock.next();
        let encrypted_timestamp = state.encrypt_and_hash(&key, &timestamp)?;

        let mut msg = HandshakeInitiation {
            sender_index,
            ephemeral_public,
            encrypted_static: to_array(&encrypted_static)?,
            encrypted_timestamp: to_array(&encrypted_timestamp)?,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        let bytes = msg.to_bytes();
        msg.mac1 = noise::compute_mac1(&peer_static, &bytes[..HandshakeInitiation::MAC1_OFFSET]);

        tracing::debug!(
            "Built handshake initiation: sender_index={}, peer={}",
            sender_index,
            hex::encode(&peer_static[..4])
        );

        let transcript = HandshakeTranscript {
            identity: identity.clone(),
            peer_static,
            psk: peer.psk_bytes(),
            ephemeral_private,
            state,
            sender_index,
        };
        Ok((transcript, msg))
    }

    /// Consume the responder's reply and derive transport keys. The
    /// transcript is used up either way; a failed response is never retried
    /// against the same transcript.
    pub fn process_response(
        &self,
        transcript: HandshakeTranscript,
        response_bytes: &[u8],
    ) -> Result<SessionKeys> {
        let mut transcript = transcript;
        let response =
            HandshakeResponse::from_bytes(response_bytes).map_err(NativeGuardError::handshake)?;

        if !noise::verify_mac1(
            transcript.identity.public_key(),
            &response_bytes[..HandshakeResponse::MAC1_OFFSET],
            &response.mac1,
        ) {
            return Err(ProtocolError::MacVerificationFailed.into());
        }

        if response.receiver_index != transcript.sender_index {
            return Err(NativeGuardError::handshake(ProtocolError::InvalidReceiverIndex {
                index: response.receiver_index,
            }));
        }

        let state = &mut transcript.state;

        // e
        state.mix_ephemeral(&response.ephemeral_public);

        // ee
        let shared = x25519::dh(&transcript.ephemeral_private, &response.ephemeral_public)
            .map_err(NativeGuardError::handshake)?;
        state.mix_key(&shared[..]);

        // se
        let shared = x25519::dh(transcript.identity.private_key(), &response.ephemeral_public)
            .map_err(NativeGuardError::handshake)?;
        state.mix_key(&shared[..]);

        // psk
        let key = Zeroizing::new(state.mix_key_and_hash(&transcript.psk));

        // {}
        state
            .decrypt_and_hash(&key, &response.encrypted_nothing)
            .map_err(NativeGuardError::handshake)?;

        let (send_key, recv_key) = state.split();
        tracing::debug!(
            "Handshake complete: local_index={}, remote_index={}, peer={}",
            transcript.sender_index,
            response.sender_index,
            hex::encode(&transcript.peer_static[..4])
        );

        Ok(SessionKeys {
            local_index: transcript.sender_index,
            remote_index: response.sender_index,
            send_key,
            recv_key,
        })
    }
}

pub(crate) fn to_array<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        NativeGuardError::handshake(ProtocolError::InvalidMessageLength {
            expected: N,
            got: data.len(),
        })
    })
}
