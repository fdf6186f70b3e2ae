//! ChaCha20-Poly1305 with WireGuard's counter nonce layout

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// 32 zero bits followed by the little-endian 64-bit counter
fn nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    bytes.into()
}

/// Seal `plaintext`, returning ciphertext with the tag appended
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(&nonce(counter), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Open a sealed buffer. Fails on any tag mismatch.
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(&nonce(counter), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}
