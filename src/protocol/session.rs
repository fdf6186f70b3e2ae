//! Session state and key rotation policy
//!
//! Keys are double-buffered: after a rotation the previous keypair stays
//! decryptable for a grace window so packets already in flight under the
//! old keys are not dropped.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;

use super::transport::TransportKeys;
use crate::config::{TunnelConfig, TunnelSettings};
use crate::keys::{encode_key, PeerKey};

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Handshaking,
    Established,
    /// Keys must be replaced before further use
    Expired,
    Error,
}

/// The remote end of a tunnel. Fixed for the lifetime of a session.
pub struct PeerConfig {
    pub key: PeerKey,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
}

impl PeerConfig {
    pub fn new(config: &TunnelConfig, key: PeerKey, endpoint: SocketAddr) -> Self {
        Self {
            key,
            endpoint,
            allowed_ips: config.allowed_ips.clone(),
            dns: config.dns.clone(),
            mtu: config.mtu,
        }
    }
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("public_key", &encode_key(&self.key.public_key))
            .field("endpoint", &self.endpoint)
            .field("allowed_ips", &self.allowed_ips)
            .field("dns", &self.dns)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Tracks the phase and the active transport keys for one tunnel
#[derive(Debug)]
pub struct SessionState {
    phase: SessionPhase,
    current: Option<Arc<TransportKeys>>,
    /// Previous keys and the instant they stop being accepted
    previous: Option<(Arc<TransportKeys>, Instant)>,
    last_handshake: Option<Instant>,
    peer: Arc<PeerConfig>,
    rotation_interval: Duration,
    reject_after: Duration,
    grace_window: Duration,
}

impl SessionState {
    pub fn new(peer: Arc<PeerConfig>, settings: &TunnelSettings) -> Self {
        Self {
            phase: SessionPhase::Idle,
            current: None,
            previous: None,
            last_handshake: None,
            peer,
            rotation_interval: settings.rotation_interval,
            reject_after: settings.reject_after,
            grace_window: settings.grace_window,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            tracing::debug!("Session phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    pub fn peer(&self) -> &Arc<PeerConfig> {
        &self.peer
    }

    pub fn last_handshake(&self) -> Option<Instant> {
        self.last_handshake
    }

    /// Keys used for sending
    pub fn current(&self) -> Option<&Arc<TransportKeys>> {
        self.current.as_ref()
    }

    /// Should a new handshake be started?
    pub fn should_rotate(&self, now: Instant) -> bool {
        match self.phase {
            SessionPhase::Expired => true,
            SessionPhase::Established => {
                let aged = self
                    .last_handshake
                    .is_some_and(|t| now.saturating_duration_since(t) >= self.rotation_interval);
                aged || self.current.as_ref().is_some_and(|k| k.nearing_exhaustion())
            }
            _ => false,
        }
    }

    /// Have the current keys outlived their hard limit?
    pub fn is_stale(&self, now: Instant) -> bool {
        self.last_handshake
            .is_some_and(|t| now.saturating_duration_since(t) >= self.reject_after)
    }

    /// Install `keys` as current. The keys they replace stay decryptable
    /// until `now + grace_window`.
    pub fn rotate(&mut self, keys: Arc<TransportKeys>, now: Instant) {
        if let Some(old) = self.current.replace(keys) {
            self.previous = Some((old, now + self.grace_window));
        }
        self.last_handshake = Some(now);
        self.set_phase(SessionPhase::Established);
    }

    /// Keys addressed by `receiver_index`, including the previous keys while
    /// their grace window is open
    pub fn find(&self, receiver_index: u32, now: Instant) -> Option<Arc<TransportKeys>> {
        if let Some(current) = self.current.as_ref().filter(|k| k.local_index() == receiver_index) {
            return Some(current.clone());
        }
        self.previous
            .as_ref()
            .filter(|(k, until)| k.local_index() == receiver_index && now < *until)
            .map(|(k, _)| k.clone())
    }

    /// Drop the previous keys once their grace window has passed
    pub fn expire_previous(&mut self, now: Instant) {
        if self.previous.as_ref().is_some_and(|(_, until)| now >= *until) {
            tracing::trace!("Previous keys left the grace window");
            self.previous = None;
        }
    }

    /// Drop every key reference held by this session
    pub fn wipe(&mut self) {
        self.current = None;
        self.previous = None;
        self.last_handshake = None;
        self.set_phase(SessionPhase::Idle);
    }

    pub fn has_key_material(&self) -> bool {
        self.current.is_some() || self.previous.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::SessionKeys;
    use crate::protocol::transport;

    fn peer() -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            key: PeerKey {
                public_key: [9u8; 32],
                preshared_key: None,
            },
            endpoint: "127.0.0.1:51820".parse().unwrap(),
            allowed_ips: vec![],
            dns: vec![],
            mtu: 1420,
        })
    }

    /// Matching (ours, theirs) keys for local index `index`
    fn keys(index: u32, seed: u8, now: Instant) -> (Arc<TransportKeys>, TransportKeys) {
        let ours = TransportKeys::new(
            SessionKeys {
                local_index: index,
                remote_index: index + 1000,
                send_key: [seed; 32],
                recv_key: [seed + 1; 32],
            },
            now,
        );
        let theirs = TransportKeys::new(
            SessionKeys {
                local_index: index + 1000,
                remote_index: index,
                send_key: [seed + 1; 32],
                recv_key: [seed; 32],
            },
            now,
        );
        (Arc::new(ours), theirs)
    }

    #[test]
    fn test_should_rotate_after_interval() {
        let settings = TunnelSettings::default();
        let mut session = SessionState::new(peer(), &settings);
        let start = Instant::now();
        assert!(!session.should_rotate(start));

        session.rotate(keys(1, 1, start).0, start);
        assert_eq!(session.phase(), SessionPhase::Established);
        assert!(!session.should_rotate(start + Duration::from_secs(119)));
        assert!(session.should_rotate(start + settings.rotation_interval));
    }

    #[test]
    fn test_should_rotate_when_expired_or_exhausted() {
        let settings = TunnelSettings::default();
        let mut session = SessionState::new(peer(), &settings);
        let now = Instant::now();
        let (current, _) = keys(1, 1, now);
        session.rotate(current.clone(), now);

        current.set_send_counter(transport::REJECT_AFTER_MESSAGES - 10);
        assert!(session.should_rotate(now));

        let (fresh, _) = keys(2, 3, now);
        session.rotate(fresh, now);
        assert!(!session.should_rotate(now));
        session.set_phase(SessionPhase::Expired);
        assert!(session.should_rotate(now));
    }

    #[test]
    fn test_old_keys_decrypt_during_grace_window() {
        let settings = TunnelSettings::default();
        let mut session = SessionState::new(peer(), &settings);
        let start = Instant::now();

        let (old, old_remote) = keys(1, 1, start);
        session.rotate(old, start);

        // Peer sends just before the rotation lands
        let in_flight = transport::seal(&old_remote, b"late packet").unwrap();

        let rotated_at = start + Duration::from_secs(120);
        let (new, _) = keys(2, 5, rotated_at);
        session.rotate(new, rotated_at);

        let within = rotated_at + Duration::from_secs(5);
        let found = session.find(1, within).expect("old keys inside grace window");
        assert_eq!(transport::open(&found, &in_flight).unwrap(), b"late packet");
        assert_eq!(session.current().unwrap().local_index(), 2);

        let after = rotated_at + settings.grace_window;
        assert!(session.find(1, after).is_none());
        session.expire_previous(after);
        assert!(session.find(2, after).is_some());
    }

    #[test]
    fn test_wipe_drops_keys() {
        let settings = TunnelSettings::default();
        let mut session = SessionState::new(peer(), &settings);
        let now = Instant::now();
        session.rotate(keys(1, 1, now).0, now);
        session.rotate(keys(2, 3, now).0, now);
        assert!(session.has_key_material());

        session.wipe();
        assert!(!session.has_key_material());
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.find(2, now).is_none());
    }

    #[test]
    fn test_staleness() {
        let settings = TunnelSettings::default();
        let mut session = SessionState::new(peer(), &settings);
        let now = Instant::now();
        assert!(!session.is_stale(now));
        session.rotate(keys(1, 1, now).0, now);
        assert!(session.is_stale(now + settings.reject_after));
    }
}
