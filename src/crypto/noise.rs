//! Noise symmetric state for the WireGuard handshake
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Chaining key and transcript hash. Both are secret-derived and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricState {
    pub chaining_key: [u8; HASH_LEN],
    pub hash: [u8; HASH_LEN],
}

impl SymmetricState {
    /// `ck = HASH(CONSTRUCTION)`, `h = HASH(HASH(ck || IDENTIFIER) || responder_static)`
    ///
    /// Both sides start from the responder's static key.
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let chaining_key = blake2s::hash(&[CONSTRUCTION]);
        let h0 = blake2s::hash(&[&chaining_key, IDENTIFIER]);
        Self {
            chaining_key,
            hash: blake2s::hash(&[&h0, responder_static]),
        }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash(&[&self.hash, data]);
    }

    /// Mix an ephemeral public key: h = HASH(h || e), ck = KDF1(ck, e)
    pub fn mix_ephemeral(&mut self, ephemeral_public: &[u8; 32]) {
        self.mix_hash(ephemeral_public);
        let [ck] = blake2s::kdf::<1>(&self.chaining_key, ephemeral_public);
        self.chaining_key = ck;
    }

    /// (ck, k) = KDF2(ck, input)
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let [ck, key] = blake2s::kdf::<2>(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// (ck, t, k) = KDF3(ck, psk); h = HASH(h || t)
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let [ck, temp, key] = blake2s::kdf::<3>(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&temp);
        key
    }

    /// c = AEAD(k, 0, plaintext, h); h = HASH(h || c)
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::seal(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-Open(k, 0, c, h); h = HASH(h || c)
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Split the final chaining key into (initiator→responder, responder→initiator) keys
    pub fn split(&self) -> ([u8; 32], [u8; 32]) {
        let [i_to_r, r_to_i] = blake2s::kdf::<2>(&self.chaining_key, &[]);
        (i_to_r, r_to_i)
    }
}

/// mac1_key = HASH(LABEL_MAC1 || receiver_static)
pub fn mac1_key(receiver_static: &[u8; 32]) -> [u8; 32] {
    blake2s::hash(&[LABEL_MAC1, receiver_static])
}

/// MAC1 over the message prefix, keyed to the receiver's static key
pub fn compute_mac1(receiver_static: &[u8; 32], prefix: &[u8]) -> [u8; 16] {
    blake2s::mac(&mac1_key(receiver_static), prefix)
}

/// Verify a received MAC1 against our own static key
pub fn verify_mac1(receiver_static: &[u8; 32], prefix: &[u8], mac1: &[u8; 16]) -> bool {
    blake2s::verify_mac(&mac1_key(receiver_static), prefix, mac1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_depends_on_responder_key() {
        let a = SymmetricState::new(&[0u8; 32]);
        let b = SymmetricState::new(&[1u8; 32]);
        assert_eq!(a.chaining_key, b.chaining_key);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_mirrored_states_agree() {
        let mut initiator = SymmetricState::new(&[42u8; 32]);
        let mut responder = initiator.clone();

        initiator.mix_ephemeral(&[3u8; 32]);
        responder.mix_ephemeral(&[3u8; 32]);

        let k1 = initiator.mix_key(b"shared");
        let k2 = responder.mix_key(b"shared");
        assert_eq!(k1, k2);

        let c = initiator.encrypt_and_hash(&k1, b"static key").unwrap();
        let p = responder.decrypt_and_hash(&k2, &c).unwrap();
        assert_eq!(p, b"static key");
        assert_eq!(initiator.hash, responder.hash);

        let psk = [5u8; 32];
        assert_eq!(initiator.mix_key_and_hash(&psk), responder.mix_key_and_hash(&psk));
        assert_eq!(initiator.split(), responder.split());
    }

    #[test]
    fn test_decrypt_and_hash_leaves_hash_on_failure() {
        let mut state = SymmetricState::new(&[1u8; 32]);
        let before = state.hash;
        assert!(state.decrypt_and_hash(&[0u8; 32], &[0u8; 16]).is_err());
        assert_eq!(state.hash, before);
    }

    #[test]
    fn test_split_keys_differ() {
        let state = SymmetricState::new(&[9u8; 32]);
        let (send, recv) = state.split();
        assert_ne!(send, recv);
    }

    #[test]
    fn test_mac1_keyed_by_receiver() {
        let prefix = [1u8; 116];
        assert_ne!(compute_mac1(&[0u8; 32], &prefix), compute_mac1(&[1u8; 32], &prefix));

        let mac1 = compute_mac1(&[0u8; 32], &prefix);
        assert!(verify_mac1(&[0u8; 32], &prefix, &mac1));
        assert!(!verify_mac1(&[1u8; 32], &prefix, &mac1));
    }
}
