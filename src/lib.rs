//! nativeguard - WireGuard-style tunnel session manager
//!
//! The engine behind a mobile VPN bridge: it validates tunnel
//! configuration, performs the Noise IKpsk2 handshake, keeps the session
//! keys (with periodic rotation) and encrypts and decrypts transport
//! packets. Raw packet capture is left to the embedding platform.
//!
//! # Features
//!
//! - WireGuard handshake (Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s)
//! - Double-buffered key rotation with a grace window
//! - 2048-counter replay window
//! - Key material wiped on disconnect
//! - `.conf` import and export
//!
//! # Usage
//!
//! ```no_run
//! use nativeguard::{TunnelConfig, TunnelManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TunnelConfig::from_file("tunnel.json")?;
//!     let manager = TunnelManager::default();
//!     manager.connect(&config).await?;
//!     println!("status: {}", manager.status());
//!     manager.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod tunnel;

pub use config::{TunnelConfig, TunnelSettings};
pub use error::{ErrorKind, NativeGuardError};
pub use keys::KeyMaterial;
pub use tunnel::{TunnelManager, TunnelStatus};
