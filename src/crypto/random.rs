//! Randomness source for ephemeral keys and session indices

use rand::rngs::OsRng;
use rand::RngCore;

/// Cryptographically secure random bytes. Injected so tests and embedders
/// can supply their own source.
pub trait SecureRandom: Send + Sync {
    fn try_fill(&self, dest: &mut [u8]) -> Result<(), rand::Error>;

    /// A random 32-bit value (session indices)
    fn next_u32(&self) -> Result<u32, rand::Error> {
        let mut buf = [0u8; 4];
        self.try_fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// The operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl SecureRandom for OsRandom {
    fn try_fill(&self, dest: &mut [u8]) -> Result<(), rand::Error> {
        OsRng.try_fill_bytes(dest)
    }
}
