//! Transport data encryption for WireGuard
//!
//! Encrypts and decrypts IP packets with ChaCha20-Poly1305 under the keys
//! from a completed handshake.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use zeroize::Zeroizing;

use super::handshake::SessionKeys;
use super::messages::TransportHeader;
use super::replay::ReplayWindow;
use crate::crypto::aead;
use crate::error::{ProtocolError, Result};

/// Maximum counter value before requiring rekey
/// WireGuard: REJECT_AFTER_MESSAGES = 2^64 - 2^13 - 1
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

/// Counters this close to the limit trigger a rotation
pub const REKEY_COUNTER_MARGIN: u64 = 1 << 16;

/// One direction pair of transport keys with its counters
pub struct TransportKeys {
    local_index: u32,
    remote_index: u32,
    send_key: Zeroizing<[u8; 32]>,
    recv_key: Zeroizing<[u8; 32]>,
    /// Next counter to send
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
    created_at: Instant,
}

impl TransportKeys {
    pub fn new(keys: SessionKeys, now: Instant) -> Self {
        Self {
            local_index: keys.local_index,
            remote_index: keys.remote_index,
            send_key: Zeroizing::new(keys.send_key),
            recv_key: Zeroizing::new(keys.recv_key),
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
            created_at: now,
        }
    }

    /// Index the peer uses to address us
    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    /// Index we use to address the peer
    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Counter the next encrypt will use
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Acquire)
    }

    /// Highest authenticated counter received, if any
    pub fn recv_counter(&self) -> Option<u64> {
        self.window().greatest()
    }

    /// Either counter is close enough to the limit that the keys should be replaced
    pub fn nearing_exhaustion(&self) -> bool {
        let limit = REJECT_AFTER_MESSAGES - REKEY_COUNTER_MARGIN;
        self.send_counter() >= limit || self.recv_counter().is_some_and(|c| c >= limit)
    }

    fn next_counter(&self) -> std::result::Result<u64, ProtocolError> {
        self.send_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < REJECT_AFTER_MESSAGES).then_some(c + 1)
            })
            .map_err(|_| ProtocolError::CounterExhausted)
    }

    fn window(&self) -> std::sync::MutexGuard<'_, ReplayWindow> {
        self.replay.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn set_send_counter(&self, value: u64) {
        self.send_counter.store(value, Ordering::Release);
    }
}

impl fmt::Debug for TransportKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportKeys")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("send_counter", &self.send_counter())
            .finish_non_exhaustive()
    }
}

/// Encrypt a packet, returning the counter used and the sealed bytes
pub fn encrypt(keys: &TransportKeys, plaintext: &[u8]) -> Result<(u64, Vec<u8>)> {
    let counter = keys.next_counter()?;
    let ciphertext = aead::seal(&keys.send_key, counter, plaintext, &[])?;
    Ok((counter, ciphertext))
}

/// Decrypt a packet sealed under `counter`.
///
/// The replay window is consulted before the AEAD and only updated once the
/// tag has verified.
pub fn decrypt(keys: &TransportKeys, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if counter >= REJECT_AFTER_MESSAGES {
        return Err(ProtocolError::ReplayDetected { counter }.into());
    }
    keys.window().check(counter)?;

    let plaintext = aead::open(&keys.recv_key, counter, ciphertext, &[])
        .map_err(|_| ProtocolError::AuthFailed { counter })?;

    // Re-check under the lock: a concurrent copy may have won the race
    let mut window = keys.window();
    window.check(counter)?;
    window.mark(counter);
    Ok(plaintext)
}

/// Encrypt and frame as a transport data message
pub fn seal(keys: &TransportKeys, plaintext: &[u8]) -> Result<Vec<u8>> {
    let (counter, ciphertext) = encrypt(keys, plaintext)?;
    tracing::trace!(
        "Sealed {} bytes: receiver_index={}, counter={}",
        plaintext.len(),
        keys.remote_index,
        counter
    );
    Ok(TransportHeader {
        receiver_index: keys.remote_index,
        counter,
    }
    .frame(&ciphertext))
}

/// Parse and decrypt a transport data message addressed to `keys`
pub fn open(keys: &TransportKeys, datagram: &[u8]) -> Result<Vec<u8>> {
    let (header, ciphertext) = TransportHeader::parse(datagram)?;
    if header.receiver_index != keys.local_index {
        return Err(ProtocolError::InvalidReceiverIndex {
            index: header.receiver_index,
        }
        .into());
    }
    decrypt(keys, header.counter, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeGuardError;

    fn pair() -> (TransportKeys, TransportKeys) {
        let now = Instant::now();
        let a = TransportKeys::new(
            SessionKeys {
                local_index: 1,
                remote_index: 2,
                send_key: [1u8; 32],
                recv_key: [2u8; 32],
            },
            now,
        );
        let b = TransportKeys::new(
            SessionKeys {
                local_index: 2,
                remote_index: 1,
                send_key: [2u8; 32],
                recv_key: [1u8; 32],
            },
            now,
        );
        (a, b)
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (a, b) = pair();
        let (counter, ciphertext) = encrypt(&a, b"hello").unwrap();
        assert_eq!(counter, 0);
        assert_eq!(decrypt(&b, counter, &ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn test_counter_increments_by_one() {
        let (a, _) = pair();
        for expected in 0..5 {
            let (counter, _) = encrypt(&a, b"x").unwrap();
            assert_eq!(counter, expected);
        }
        assert_eq!(a.send_counter(), 5);
    }

    #[test]
    fn test_counter_exhaustion() {
        let (a, _) = pair();
        a.set_send_counter(REJECT_AFTER_MESSAGES - 1);
        let (counter, _) = encrypt(&a, b"last").unwrap();
        assert_eq!(counter, REJECT_AFTER_MESSAGES - 1);

        let err = encrypt(&a, b"one too many").unwrap_err();
        assert!(matches!(
            err,
            NativeGuardError::Protocol(ProtocolError::CounterExhausted)
        ));
        assert_eq!(err.code(), "COUNTER_EXHAUSTED");
        // the failed attempt does not move the counter
        assert_eq!(a.send_counter(), REJECT_AFTER_MESSAGES);
    }

    #[test]
    fn test_nearing_exhaustion() {
        let (a, _) = pair();
        assert!(!a.nearing_exhaustion());
        a.set_send_counter(REJECT_AFTER_MESSAGES - REKEY_COUNTER_MARGIN);
        assert!(a.nearing_exhaustion());
    }

    #[test]
    fn test_replay_detected() {
        let (a, b) = pair();
        let (counter, ciphertext) = encrypt(&a, b"once").unwrap();
        decrypt(&b, counter, &ciphertext).unwrap();

        let err = decrypt(&b, counter, &ciphertext).unwrap_err();
        assert_eq!(err.code(), "REPLAY_DETECTED");
    }

    #[test]
    fn test_forged_packet_does_not_burn_counter() {
        let (a, b) = pair();
        let (counter, ciphertext) = encrypt(&a, b"real").unwrap();

        let mut forged = ciphertext.clone();
        forged[0] ^= 0xff;
        let err = decrypt(&b, counter, &forged).unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");

        assert_eq!(decrypt(&b, counter, &ciphertext).unwrap(), b"real");
        assert_eq!(b.recv_counter(), Some(counter));
    }

    #[test]
    fn test_seal_open_framing() {
        let (a, b) = pair();
        let msg = seal(&a, b"packet").unwrap();
        assert_eq!(msg[0], 4);
        assert_eq!(&msg[4..8], &2u32.to_le_bytes());
        assert_eq!(open(&b, &msg).unwrap(), b"packet");

        // addressed to a different session
        let msg = seal(&b, b"packet").unwrap();
        assert!(matches!(
            open(&b, &msg),
            Err(NativeGuardError::Protocol(ProtocolError::InvalidReceiverIndex { index: 1 }))
        ));
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let (a, b) = pair();
        let msg = seal(&a, &[]).unwrap();
        assert_eq!(msg.len(), TransportHeader::MIN_SIZE);
        assert!(open(&b, &msg).unwrap().is_empty());
    }
}
