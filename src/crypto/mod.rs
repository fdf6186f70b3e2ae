//! Cryptographic primitives for the WireGuard handshake and transport
//!
//! - BLAKE2s hashing, MAC1 and HKDF (blake2s)
//! - ChaCha20-Poly1305 AEAD (aead)
//! - X25519 Diffie-Hellman (x25519)
//! - Noise IKpsk2 symmetric state (noise)
//! - Injectable randomness (random)

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod random;
pub mod x25519;
