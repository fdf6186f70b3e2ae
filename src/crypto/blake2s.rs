//! BLAKE2s hashing, keyed MAC and HKDF as used by the WireGuard handshake

use blake2::{
    digest::{consts::U16, FixedOutput, KeyInit, Mac, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

/// HMAC-BLAKE2s (RFC 2104). `SimpleHmac` because BLAKE2s has no block-level core.
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of the keyed BLAKE2s MAC (MAC1)
pub const MAC_LEN: usize = 16;

/// HASH(a || b || ...)
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// Keyed BLAKE2s with a 16-byte output, used for MAC1
pub fn mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = <Blake2sMac<U16> as KeyInit>::new(key.into());
    Mac::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// Constant-time check of a keyed BLAKE2s tag
pub fn verify_mac(key: &[u8; HASH_LEN], data: &[u8], tag: &[u8; MAC_LEN]) -> bool {
    let mut mac = <Blake2sMac<U16> as KeyInit>::new(key.into());
    Mac::update(&mut mac, data);
    mac.verify_slice(tag).is_ok()
}

/// HMAC-BLAKE2s
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = <HmacBlake2s as KeyInit>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HKDF with HMAC-BLAKE2s producing `N` chained 32-byte outputs.
///
/// ```text
/// prk = HMAC(key, input)
/// T1  = HMAC(prk, 0x01)
/// Ti  = HMAC(prk, T(i-1) || i)
/// ```
pub fn kdf<const N: usize>(key: &[u8; HASH_LEN], input: &[u8]) -> [[u8; HASH_LEN]; N] {
    let prk = hmac(key, input);
    let mut out = [[0u8; HASH_LEN]; N];
    let mut block = [0u8; HASH_LEN + 1];

    for i in 0..N {
        let counter = (i + 1) as u8;
        out[i] = if i == 0 {
            hmac(&prk, &[counter])
        } else {
            block[..HASH_LEN].copy_from_slice(&out[i - 1]);
            block[HASH_LEN] = counter;
            hmac(&prk, &block)
        };
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_concatenates_parts() {
        let joined = hash(&[b"helloworld"]);
        let split = hash(&[b"hello", b"world"]);
        assert_eq!(joined, split);
        assert_ne!(joined, hash(&[b"hello"]));
    }

    #[test]
    fn test_mac_is_keyed() {
        let data = b"handshake bytes";
        let a = mac(&[0u8; 32], data);
        let b = mac(&[1u8; 32], data);
        assert_eq!(a.len(), MAC_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf_prefix_stability() {
        // Each output depends only on the outputs before it, so asking for
        // more outputs never changes the earlier ones.
        let key = [7u8; 32];
        let [one] = kdf::<1>(&key, b"ikm");
        let [a, b] = kdf::<2>(&key, b"ikm");
        let [x, y, z] = kdf::<3>(&key, b"ikm");

        assert_eq!(one, a);
        assert_eq!(a, x);
        assert_eq!(b, y);
        assert_ne!(y, z);
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf_empty_input() {
        let [send, recv] = kdf::<2>(&[0u8; 32], &[]);
        assert_ne!(send, recv);
        assert_ne!(send, [0u8; 32]);
    }
}
