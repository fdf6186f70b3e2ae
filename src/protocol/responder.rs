//! Responder side of the WireGuard handshake
//!
//! Used by the loopback harness and the `check` command to exercise the
//! initiator end to end, and by anything that needs to terminate a tunnel.

use std::collections::HashMap;
use std::fmt;

use zeroize::Zeroizing;

use super::handshake::{to_array, SessionKeys};
use super::messages::{HandshakeInitiation, HandshakeResponse};
use super::timestamp::{self, TIMESTAMP_LEN};
use crate::crypto::noise::{self, SymmetricState};
use crate::crypto::random::SecureRandom;
use crate::crypto::x25519;
use crate::error::{NativeGuardError, ProtocolError, Result};
use crate::keys::{Identity, PresharedKey};

struct KnownPeer {
    preshared_key: Option<PresharedKey>,
    last_timestamp: Option<[u8; TIMESTAMP_LEN]>,
}

/// A validated initiation waiting for [`Responder::respond`]
pub struct PendingResponse {
    peer_static: [u8; 32],
    initiator_index: u32,
    initiator_ephemeral: [u8; 32],
    psk: Zeroizing<[u8; 32]>,
    state: SymmetricState,
}

impl PendingResponse {
    /// The initiator's static public key
    pub fn peer_static(&self) -> &[u8; 32] {
        &self.peer_static
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("initiator_index", &self.initiator_index)
            .finish_non_exhaustive()
    }
}

/// Accepts initiations from a fixed set of peers
pub struct Responder {
    identity: Identity,
    peers: HashMap<[u8; 32], KnownPeer>,
}

impl Responder {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            peers: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        self.identity.public_key()
    }

    /// Allow `public_key` to initiate, optionally with a PSK
    pub fn add_peer(&mut self, public_key: [u8; 32], preshared_key: Option<PresharedKey>) {
        self.peers.insert(
            public_key,
            KnownPeer {
                preshared_key,
                last_timestamp: None,
            },
        );
    }

    /// Authenticate an initiation and identify its sender.
    ///
    /// Rejects unknown peers and any initiation whose timestamp is not newer
    /// than the last accepted one from the same peer.
    pub fn consume_initiation(&mut self, bytes: &[u8]) -> Result<PendingResponse> {
        let init = HandshakeInitiation::from_bytes(bytes)?;

        if !noise::verify_mac1(
            self.identity.public_key(),
            &bytes[..HandshakeInitiation::MAC1_OFFSET],
            &init.mac1,
        ) {
            return Err(ProtocolError::MacVerificationFailed.into());
        }

        let mut state = SymmetricState::new(self.identity.public_key());

        // e
        state.mix_ephemeral(&init.ephemeral_public);

        // es
        let shared = x25519::dh(self.identity.private_key(), &init.ephemeral_public)?;
        let key = Zeroizing::new(state.mix_key(&shared[..]));

        // s
        let peer_static: [u8; 32] = to_array(&state.decrypt_and_hash(&key, &init.encrypted_static)?)?;
        let peer = self
            .peers
            .get_mut(&peer_static)
            .ok_or(ProtocolError::UnknownPeer)?;

        // ss
        let shared = x25519::dh(self.identity.private_key(), &peer_static)?;
        let key = Zeroizing::new(state.mix_key(&shared[..]));

        // {timestamp}
        let stamp: [u8; TIMESTAMP_LEN] =
            to_array(&state.decrypt_and_hash(&key, &init.encrypted_timestamp)?)?;
        if !timestamp::is_newer(&stamp, peer.last_timestamp.as_ref()) {
            tracing::warn!(
                "Rejecting replayed initiation from {}",
                hex::encode(&peer_static[..4])
            );
            return Err(ProtocolError::StaleTimestamp.into());
        }
        peer.last_timestamp = Some(stamp);

        let psk = Zeroizing::new(
            peer.preshared_key
                .as_ref()
                .map(|psk| *psk.as_bytes())
                .unwrap_or([0u8; 32]),
        );

        tracing::debug!(
            "Accepted initiation: sender_index={}, peer={}",
            init.sender_index,
            hex::encode(&peer_static[..4])
        );

        Ok(PendingResponse {
            peer_static,
            initiator_index: init.sender_index,
            initiator_ephemeral: init.ephemeral_public,
            psk,
            state,
        })
    }

    /// Build the response and derive our transport keys
    pub fn respond(
        &self,
        pending: PendingResponse,
        random: &dyn SecureRandom,
    ) -> Result<(HandshakeResponse, SessionKeys)> {
        let mut pending = pending;
        let sender_index = random.next_u32().map_err(NativeGuardError::handshake)?;
        let mut ephemeral_private = Zeroizing::new([0u8; 32]);
        random
            .try_fill(&mut ephemeral_private[..])
            .map_err(NativeGuardError::handshake)?;
        let ephemeral_public = x25519::public_key(&ephemeral_private);

        let state = &mut pending.state;

        // e
        state.mix_ephemeral(&ephemeral_public);

        // ee
        let shared = x25519::dh(&ephemeral_private, &pending.initiator_ephemeral)?;
        state.mix_key(&shared[..]);

        // se
        let shared = x25519::dh(&ephemeral_private, &pending.peer_static)?;
        state.mix_key(&shared[..]);

        // psk
        let key = Zeroizing::new(state.mix_key_and_hash(&pending.psk));

        // {}
        let encrypted_nothing = to_array(&state.encrypt_and_hash(&key, &[])?)?;

        let mut msg = HandshakeResponse {
            sender_index,
            receiver_index: pending.initiator_index,
            ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        let bytes = msg.to_bytes();
        msg.mac1 = noise::compute_mac1(
            &pending.peer_static,
            &bytes[..HandshakeResponse::MAC1_OFFSET],
        );

        let (i_to_r, r_to_i) = state.split();
        let keys = SessionKeys {
            local_index: sender_index,
            remote_index: pending.initiator_index,
            send_key: r_to_i,
            recv_key: i_to_r,
        };
        Ok((msg, keys))
    }
}
