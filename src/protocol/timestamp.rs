//! TAI64N handshake timestamps
//!
//! The initiator encrypts a TAI64N timestamp into every initiation; the
//! responder only accepts a peer's initiation if its timestamp is newer than
//! the last one it accepted from that peer.

use std::sync::Mutex;

use tai64::Tai64N;

/// Length of an encoded TAI64N label
pub const TIMESTAMP_LEN: usize = 12;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Produces strictly increasing TAI64N timestamps, even when the wall clock
/// stalls or steps backwards.
#[derive(Debug, Default)]
pub struct TimestampClock {
    last: Mutex<Option<[u8; TIMESTAMP_LEN]>>,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, never less than or equal to a previous one
    pub fn next(&self) -> [u8; TIMESTAMP_LEN] {
        let now = Tai64N::now().to_bytes();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let stamp = match *last {
            Some(prev) if now <= prev => successor(&prev),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

/// The label one nanosecond after `stamp`. TAI64N is big-endian seconds then
/// nanoseconds, so byte order and time order agree.
fn successor(stamp: &[u8; TIMESTAMP_LEN]) -> [u8; TIMESTAMP_LEN] {
    let mut secs_bytes = [0u8; 8];
    secs_bytes.copy_from_slice(&stamp[..8]);
    let mut nanos_bytes = [0u8; 4];
    nanos_bytes.copy_from_slice(&stamp[8..]);

    let mut secs = u64::from_be_bytes(secs_bytes);
    let mut nanos = u32::from_be_bytes(nanos_bytes) + 1;
    if nanos >= NANOS_PER_SEC {
        nanos = 0;
        secs = secs.wrapping_add(1);
    }

    let mut out = [0u8; TIMESTAMP_LEN];
    out[..8].copy_from_slice(&secs.to_be_bytes());
    out[8..].copy_from_slice(&nanos.to_be_bytes());
    out
}

/// Is `candidate` strictly newer than `previous`?
pub fn is_newer(candidate: &[u8; TIMESTAMP_LEN], previous: Option<&[u8; TIMESTAMP_LEN]>) -> bool {
    previous.map_or(true, |prev| candidate > prev)
}
