//! Tunnel manager
//!
//! Owns one tunnel: validates the configuration, runs the handshake, holds
//! the session and moves packets between the caller and the transport.
//! Background tasks (the inbound pump and the rotation timer) are started by
//! `connect` and stopped by `disconnect`.

pub mod io;
pub mod platform;
mod status;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::config::{TunnelConfig, TunnelSettings};
use crate::crypto::random::{OsRandom, SecureRandom};
use crate::error::{
    ErrorKind, NativeGuardError, NetworkError, ProtocolError, Result, TunnelError,
};
use crate::keys::KeyMaterial;
use crate::protocol::messages::{self, HandshakeResponse, MessageType, TransportHeader};
use crate::protocol::transport::{self, TransportKeys};
use crate::protocol::{HandshakeEngine, PeerConfig, SessionKeys, SessionPhase, SessionState};

pub use io::{PacketTransport, UdpTransport};
pub use status::TunnelStatus;

/// Floor for the rotation check period; `interval` rejects zero
const MIN_CHECK_PERIOD: Duration = Duration::from_millis(1);

enum TransportSource {
    /// Bind a UDP socket per connect
    Udp,
    /// Use the same caller-supplied transport for every connect
    Fixed(Arc<dyn PacketTransport>),
}

struct PendingHandshake {
    sender_index: u32,
    reply: oneshot::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    /// Bumped by every connect and disconnect; stale async work compares
    /// against it before committing
    generation: u64,
    attempt: Option<CancellationToken>,
    tasks: Option<CancellationToken>,
    keys: Option<Arc<KeyMaterial>>,
    session: Option<SessionState>,
    transport: Option<Arc<dyn PacketTransport>>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
}

struct Shared {
    settings: TunnelSettings,
    engine: HandshakeEngine,
    random: Arc<dyn SecureRandom>,
    source: TransportSource,
    inner: Mutex<Inner>,
    status: watch::Sender<TunnelStatus>,
    /// At most one handshake in flight
    handshake_gate: Mutex<()>,
    pending: std::sync::Mutex<Option<PendingHandshake>>,
    auth_failures: AtomicU32,
}

impl Shared {
    fn set_status(&self, status: TunnelStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::info!("Tunnel status: {} -> {}", previous, status);
        }
    }

    fn set_pending(&self, pending: Option<PendingHandshake>) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = pending;
    }

    /// Stop background work and drop every key reference
    fn teardown(&self, inner: &mut Inner) {
        if let Some(tasks) = inner.tasks.take() {
            tasks.cancel();
        }
        inner.attempt = None;
        inner.keys = None;
        inner.transport = None;
        inner.inbound = None;
        if let Some(session) = inner.session.as_mut() {
            session.wipe();
        }
        inner.session = None;
        self.set_pending(None);
        self.auth_failures.store(0, Ordering::Relaxed);
    }

    /// Drop every key, PSK included, and park the tunnel in `Faulted`
    /// until the caller disconnects
    fn fault(&self, inner: &mut Inner) {
        self.teardown(inner);
        self.set_status(TunnelStatus::Faulted);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(tasks) = self.inner.get_mut().tasks.take() {
            tasks.cancel();
        }
    }
}

/// Handle to a single tunnel. Cheap to clone; clones share the tunnel.
#[derive(Clone)]
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new(TunnelSettings::default())
    }
}

impl TunnelManager {
    /// Manager that talks UDP to the configured server
    pub fn new(settings: TunnelSettings) -> Self {
        Self::build(settings, TransportSource::Udp, Arc::new(OsRandom))
    }

    /// Manager over caller-supplied collaborators
    pub fn with_collaborators(
        settings: TunnelSettings,
        transport: Arc<dyn PacketTransport>,
        random: Arc<dyn SecureRandom>,
    ) -> Self {
        Self::build(settings, TransportSource::Fixed(transport), random)
    }

    fn build(
        settings: TunnelSettings,
        source: TransportSource,
        random: Arc<dyn SecureRandom>,
    ) -> Self {
        let (status, _) = watch::channel(TunnelStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                settings,
                engine: HandshakeEngine::new(),
                random,
                source,
                inner: Mutex::new(Inner::default()),
                status,
                handshake_gate: Mutex::new(()),
                pending: std::sync::Mutex::new(None),
                auth_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Check that this host can run a tunnel at all
    pub fn initialize(&self) -> Result<()> {
        if let Some(reason) = platform::unsupported_reason() {
            return Err(TunnelError::Unsupported { reason }.into());
        }

        let mut probe = [0u8; 32];
        self.shared
            .random
            .try_fill(&mut probe)
            .map_err(|e| TunnelError::Unsupported {
                reason: format!("random source unavailable: {}", e),
            })?;

        tracing::info!("Tunnel engine initialized");
        Ok(())
    }

    /// Current lifecycle state. Never blocks.
    pub fn status(&self) -> TunnelStatus {
        *self.shared.status.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.shared.status.subscribe()
    }

    /// Stream of lifecycle transitions, starting with the current status
    pub fn status_updates(&self) -> WatchStream<TunnelStatus> {
        WatchStream::new(self.shared.status.subscribe())
    }

    /// Can this host provide raw packet I/O?
    pub fn is_device_supported(&self) -> bool {
        platform::packet_io_supported()
    }

    /// Phase of the current session, if one exists. A faulted tunnel has
    /// already dropped its session and reports `Error`.
    pub async fn session_phase(&self) -> Option<SessionPhase> {
        let inner = self.shared.inner.lock().await;
        match inner.session.as_ref() {
            Some(session) => Some(session.phase()),
            None if self.status() == TunnelStatus::Faulted => Some(SessionPhase::Error),
            None => None,
        }
    }

    /// Is any key material (static, preshared or transport) still held?
    pub async fn has_key_material(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.keys.is_some()
            || inner.session.as_ref().is_some_and(|s| {
                s.has_key_material() || s.peer().key.preshared_key.is_some()
            })
    }

    /// Take the receiver for decrypted inbound packets. Available once per connect.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.shared.inner.lock().await.inbound.take()
    }

    /// Connect from a loosely-typed configuration map
    pub async fn connect_map(&self, map: &serde_json::Value) -> Result<()> {
        let config = TunnelConfig::from_value(map)?;
        self.connect(&config).await
    }

    pub async fn connect(&self, config: &TunnelConfig) -> Result<()> {
        self.connect_with_cancel(config, CancellationToken::new())
            .await
    }

    /// Bring the tunnel up. Cancelling `cancel` mid-handshake abandons the
    /// attempt and returns the tunnel to `Disconnected`.
    pub async fn connect_with_cancel(
        &self,
        config: &TunnelConfig,
        cancel: CancellationToken,
    ) -> Result<()> {
        let keys = Arc::new(KeyMaterial::load(config)?);

        let attempt = CancellationToken::new();
        let generation = {
            let mut inner = self.shared.inner.lock().await;
            let current = self.status();
            if current != TunnelStatus::Disconnected {
                return Err(TunnelError::AlreadyConnected {
                    state: current.to_string(),
                }
                .into());
            }
            inner.generation += 1;
            inner.attempt = Some(attempt.clone());
            inner.keys = Some(keys.clone());
            self.shared.set_status(TunnelStatus::Connecting);
            inner.generation
        };

        tracing::info!("Connecting to {}", config.endpoint());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled.into()),
            _ = attempt.cancelled() => Err(TunnelError::Cancelled.into()),
            result = self.establish(config, keys, generation) => result,
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(NativeGuardError::Tunnel(TunnelError::Cancelled)) => {
                tracing::info!("Connect cancelled");
                self.abort_connect(generation, false).await;
                Err(TunnelError::Cancelled.into())
            }
            Err(err) => {
                tracing::error!("Connect failed: {}", err);
                self.abort_connect(generation, true).await;
                if err.kind() == ErrorKind::HandshakeFailed {
                    Err(err)
                } else {
                    Err(NativeGuardError::handshake(err))
                }
            }
        }
    }

    async fn establish(
        &self,
        config: &TunnelConfig,
        keys: Arc<KeyMaterial>,
        generation: u64,
    ) -> Result<()> {
        let endpoint = io::resolve(&config.server_address, config.server_port).await?;
        let transport = self.open_transport(endpoint).await?;
        let peer = Arc::new(PeerConfig::new(config, keys.peer.clone(), endpoint));

        let tasks = CancellationToken::new();
        let (sink, inbound) = mpsc::channel(self.shared.settings.inbound_capacity.max(1));
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.generation != generation {
                return Err(TunnelError::Cancelled.into());
            }
            let mut session = SessionState::new(peer, &self.shared.settings);
            session.set_phase(SessionPhase::Handshaking);
            inner.session = Some(session);
            inner.transport = Some(transport.clone());
            inner.tasks = Some(tasks.clone());
            inner.inbound = Some(inbound);
        }
        tokio::spawn(inbound_pump(
            Arc::downgrade(&self.shared),
            transport.clone(),
            sink,
            tasks.clone(),
        ));

        let session_keys = self.run_handshake(&keys, &transport, endpoint).await?;

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || self.status() != TunnelStatus::Connecting {
            return Err(TunnelError::Cancelled.into());
        }
        let session = inner.session.as_mut().ok_or(TunnelError::NotConnected)?;
        let now = Instant::now();
        let keys = Arc::new(TransportKeys::new(session_keys, now));
        tracing::info!(
            "Session established with {} (local_index={})",
            endpoint,
            keys.local_index()
        );
        session.rotate(keys, now);
        self.shared.auth_failures.store(0, Ordering::Relaxed);
        self.shared.set_status(TunnelStatus::Connected);

        tokio::spawn(rotation_timer(
            Arc::downgrade(&self.shared),
            self.shared.settings.rotation_check_period,
            tasks,
        ));
        Ok(())
    }

    /// Undo a connect that did not complete. A no-op if a disconnect or a
    /// newer connect already took over.
    async fn abort_connect(&self, generation: u64, faulted: bool) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || self.status() != TunnelStatus::Connecting {
            return;
        }

        if faulted {
            self.shared.fault(&mut inner);
        } else {
            self.shared.teardown(&mut inner);
            self.shared.set_status(TunnelStatus::Disconnected);
        }
    }

    async fn open_transport(&self, endpoint: SocketAddr) -> Result<Arc<dyn PacketTransport>> {
        match &self.shared.source {
            TransportSource::Fixed(transport) => Ok(transport.clone()),
            TransportSource::Udp => Ok(Arc::new(UdpTransport::bind_for(endpoint).await?)),
        }
    }

    /// Send an initiation and wait for the matching response. Holds the
    /// handshake gate, never the state lock.
    async fn run_handshake(
        &self,
        keys: &KeyMaterial,
        transport: &Arc<dyn PacketTransport>,
        endpoint: SocketAddr,
    ) -> Result<SessionKeys> {
        let _gate = self.shared.handshake_gate.lock().await;

        let result = async {
            let (transcript, initiation) = self.shared.engine.begin_handshake(
                &keys.identity,
                &keys.peer,
                self.shared.random.as_ref(),
            )?;

            let (reply, response) = oneshot::channel();
            self.shared.set_pending(Some(PendingHandshake {
                sender_index: transcript.sender_index(),
                reply,
            }));

            transport
                .send_to(&initiation.to_bytes(), endpoint)
                .await
                .map_err(|e| NetworkError::SendFailed {
                    reason: e.to_string(),
                })?;
            tracing::debug!(
                "Sent handshake initiation to {} (sender_index={})",
                endpoint,
                transcript.sender_index()
            );

            let timeout = self.shared.settings.handshake_timeout;
            let bytes = match tokio::time::timeout(timeout, response).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(_)) => return Err(NativeGuardError::handshake("handshake abandoned")),
                Err(_) => {
                    return Err(ProtocolError::HandshakeTimeout {
                        seconds: timeout.as_secs(),
                    }
                    .into())
                }
            };

            self.shared.engine.process_response(transcript, &bytes)
        }
        .await;

        self.shared.set_pending(None);
        result
    }

    /// Tear the tunnel down and wipe its keys. Safe to call in any state.
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let current = self.status();
        if matches!(
            current,
            TunnelStatus::Disconnected | TunnelStatus::Disconnecting
        ) {
            tracing::debug!("Disconnect requested while {}", current);
            return Ok(());
        }

        self.shared.set_status(TunnelStatus::Disconnecting);
        if let Some(attempt) = inner.attempt.take() {
            attempt.cancel();
        }
        inner.generation += 1;
        self.shared.teardown(&mut inner);
        self.shared.set_status(TunnelStatus::Disconnected);
        Ok(())
    }

    /// Encrypt `packet` under the current keys and send it to the server
    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let (keys, transport, endpoint) = {
            let mut guard = self.shared.inner.lock().await;
            let inner = &mut *guard;
            if self.status() != TunnelStatus::Connected {
                return Err(TunnelError::NotConnected.into());
            }
            let session = inner.session.as_mut().ok_or(TunnelError::NotConnected)?;
            if session.is_stale(Instant::now()) {
                session.set_phase(SessionPhase::Expired);
                return Err(ProtocolError::SessionExpired.into());
            }
            let keys = session.current().cloned().ok_or(TunnelError::NotConnected)?;
            let transport = inner.transport.clone().ok_or(TunnelError::NotConnected)?;
            (keys, transport, session.peer().endpoint)
        };

        let datagram = match transport::seal(&keys, packet) {
            Err(err @ NativeGuardError::Protocol(ProtocolError::CounterExhausted)) => {
                tracing::warn!("Send counter exhausted, forcing rotation");
                self.expire_session().await;
                return Err(err);
            }
            other => other?,
        };

        transport
            .send_to(&datagram, endpoint)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Decrypt a transport data message from the server
    pub async fn handle_datagram(&self, datagram: &[u8]) -> Result<Vec<u8>> {
        let (header, _) = TransportHeader::parse(datagram)?;
        let keys = {
            let inner = self.shared.inner.lock().await;
            let session = inner.session.as_ref().ok_or(TunnelError::NotConnected)?;
            session
                .find(header.receiver_index, Instant::now())
                .ok_or(ProtocolError::InvalidReceiverIndex {
                    index: header.receiver_index,
                })?
        };

        match transport::open(&keys, datagram) {
            Ok(packet) => {
                self.shared.auth_failures.store(0, Ordering::Relaxed);
                Ok(packet)
            }
            Err(err) => {
                if matches!(err, NativeGuardError::Protocol(ProtocolError::AuthFailed { .. })) {
                    let failures = self.shared.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures > self.shared.settings.max_auth_failures {
                        tracing::warn!(
                            "{} consecutive authentication failures, forcing rotation",
                            failures
                        );
                        self.shared.auth_failures.store(0, Ordering::Relaxed);
                        self.expire_session().await;
                    }
                }
                Err(err)
            }
        }
    }

    async fn expire_session(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(session) = inner.session.as_mut() {
            if session.phase() == SessionPhase::Established {
                session.set_phase(SessionPhase::Expired);
            }
        }
    }

    /// Is a key rotation due?
    pub async fn should_rotate(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner
            .session
            .as_ref()
            .is_some_and(|s| s.should_rotate(Instant::now()))
    }

    /// Run a fresh handshake and install its keys. The old keys keep working
    /// until the new ones are committed, and for the grace window after.
    pub async fn rotate(&self) -> Result<()> {
        let (keys, transport, endpoint, generation) = {
            let inner = self.shared.inner.lock().await;
            if self.status() != TunnelStatus::Connected {
                return Err(TunnelError::NotConnected.into());
            }
            let session = inner.session.as_ref().ok_or(TunnelError::NotConnected)?;
            (
                inner.keys.clone().ok_or(TunnelError::NotConnected)?,
                inner.transport.clone().ok_or(TunnelError::NotConnected)?,
                session.peer().endpoint,
                inner.generation,
            )
        };

        tracing::info!("Rotating session keys");
        let session_keys = match self.run_handshake(&keys, &transport, endpoint).await {
            Ok(session_keys) => session_keys,
            Err(err) => {
                tracing::warn!("Key rotation failed: {}", err);
                self.fault_if_stale(generation).await;
                return Err(err);
            }
        };

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || self.status() != TunnelStatus::Connected {
            return Err(TunnelError::NotConnected.into());
        }
        let session = inner.session.as_mut().ok_or(TunnelError::NotConnected)?;
        let now = Instant::now();
        let keys = Arc::new(TransportKeys::new(session_keys, now));
        tracing::debug!("Installed rotated keys (local_index={})", keys.local_index());
        session.rotate(keys, now);
        self.shared.auth_failures.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// After a failed rotation: once the current keys are past their hard
    /// limit the tunnel can no longer carry traffic, so it faults
    async fn fault_if_stale(&self, generation: u64) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || self.status() != TunnelStatus::Connected {
            return;
        }
        let stale = inner
            .session
            .as_ref()
            .is_some_and(|s| s.is_stale(Instant::now()));
        if stale {
            tracing::error!("Session keys expired and rotation failed");
            self.shared.fault(&mut inner);
        }
    }

    /// Periodic housekeeping; returns whether a rotation is due
    async fn maintain(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let now = Instant::now();
        match inner.session.as_mut() {
            Some(session) => {
                session.expire_previous(now);
                session.should_rotate(now)
            }
            None => false,
        }
    }

    async fn dispatch(&self, datagram: &[u8], sink: &mpsc::Sender<Vec<u8>>) {
        match messages::message_type(datagram) {
            Ok(MessageType::HandshakeResponse) => self.deliver_response(datagram),
            Ok(MessageType::TransportData) => match self.handle_datagram(datagram).await {
                Ok(packet) if packet.is_empty() => tracing::trace!("Keepalive received"),
                Ok(packet) => match sink.try_send(packet) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!("Inbound queue full, dropping packet")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::trace!("Inbound receiver dropped, discarding packet")
                    }
                },
                Err(e) => tracing::debug!("Dropping transport packet: {}", e),
            },
            Ok(other) => tracing::debug!("Ignoring {:?} message", other),
            Err(e) => tracing::trace!("Ignoring datagram: {}", e),
        }
    }

    fn deliver_response(&self, datagram: &[u8]) {
        let receiver_index = match HandshakeResponse::from_bytes(datagram) {
            Ok(response) => response.receiver_index,
            Err(e) => {
                tracing::debug!("Malformed handshake response: {}", e);
                return;
            }
        };

        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(waiting) if waiting.sender_index == receiver_index => {
                let _ = waiting.reply.send(datagram.to_vec());
            }
            Some(waiting) => {
                tracing::debug!(
                    "Handshake response for index {} while waiting on {}",
                    receiver_index,
                    waiting.sender_index
                );
                *pending = Some(waiting);
            }
            None => tracing::debug!("Unsolicited handshake response"),
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

/// Read datagrams from the transport and route them
async fn inbound_pump(
    shared: Weak<Shared>,
    transport: Arc<dyn PacketTransport>,
    sink: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; io::MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, from)) => {
                tracing::trace!("Received {} bytes from {}", len, from);
                let Some(shared) = shared.upgrade() else { break };
                TunnelManager { shared }
                    .dispatch(&buf[..len], &sink)
                    .await;
            }
            Err(e) if is_transient(&e) => tracing::trace!("Transient receive error: {}", e),
            Err(e) => {
                tracing::warn!("Transport receive failed, stopping inbound pump: {}", e);
                break;
            }
        }
    }
    tracing::debug!("Inbound pump stopped");
}

/// Expire old keys and start rotations when due
async fn rotation_timer(shared: Weak<Shared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period.max(MIN_CHECK_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                let manager = TunnelManager { shared };
                if manager.maintain().await {
                    // failures are logged by rotate; the next tick retries
                    let _ = manager.rotate().await;
                }
            }
        }
    }
    tracing::debug!("Rotation timer stopped");
}
