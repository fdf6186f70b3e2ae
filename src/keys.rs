//! Static key material: our identity, the peer's static key and the PSK

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::TunnelConfig;
use crate::crypto::x25519::{self, KEY_LEN};
use crate::error::ConfigError;

/// Our static X25519 keypair. The private half is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    private_key: [u8; KEY_LEN],
    public_key: [u8; KEY_LEN],
}

impl Identity {
    /// Build an identity, deriving the public key from the private key.
    /// The secret is copied straight into the wiped-on-drop field.
    pub fn from_private(private_key: &[u8; KEY_LEN]) -> Self {
        Self {
            public_key: x25519::public_key(private_key),
            private_key: *private_key,
        }
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    pub(crate) fn private_key(&self) -> &[u8; KEY_LEN] {
        &self.private_key
    }

    /// True once [`Zeroize::zeroize`] has wiped both halves
    pub fn is_wiped(&self) -> bool {
        self.private_key == [0u8; KEY_LEN] && self.public_key == [0u8; KEY_LEN]
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &BASE64.encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// 32-byte preshared key mixed into the handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; KEY_LEN]);

impl PresharedKey {
    pub fn new(bytes: &[u8; KEY_LEN]) -> Self {
        Self(*bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey(<redacted>)")
    }
}

/// The server's static key and the optional PSK shared with it
#[derive(Debug, Clone)]
pub struct PeerKey {
    pub public_key: [u8; KEY_LEN],
    pub preshared_key: Option<PresharedKey>,
}

impl PeerKey {
    /// PSK bytes, or all zeros when none is configured
    pub(crate) fn psk_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(
            self.preshared_key
                .as_ref()
                .map(|psk| *psk.as_bytes())
                .unwrap_or([0u8; KEY_LEN]),
        )
    }
}

/// Decoded and validated keys for one tunnel
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub identity: Identity,
    pub peer: PeerKey,
}

impl KeyMaterial {
    /// Decode and validate the keys named in `config`. No I/O.
    pub fn load(config: &TunnelConfig) -> Result<Self, ConfigError> {
        let private_key = decode_key(&config.private_key, "privateKey")?;
        let identity = Identity::from_private(&private_key);

        let peer_public = *decode_key(&config.public_key, "publicKey")?;
        if !x25519::is_valid_public_key(&peer_public) {
            return Err(ConfigError::InvalidField {
                field: "publicKey".to_string(),
                reason: "not a usable Curve25519 point".to_string(),
            });
        }

        let preshared_key = config
            .preshared_key
            .as_ref()
            .map(|psk| decode_key(psk, "presharedKey").map(|k| PresharedKey::new(&k)))
            .transpose()?;

        Ok(Self {
            identity,
            peer: PeerKey {
                public_key: peer_public,
                preshared_key,
            },
        })
    }
}

/// Decode a base64 32-byte key
pub fn decode_key(value: &str, field: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, ConfigError> {
    let invalid = || ConfigError::InvalidKey {
        field: field.to_string(),
    };

    let bytes = Zeroizing::new(BASE64.decode(value.trim()).map_err(|_| invalid())?);
    if bytes.len() != KEY_LEN {
        return Err(invalid());
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Base64 form used in configs and logs
pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with(private_key: &str, public_key: &str, psk: Option<&str>) -> TunnelConfig {
        let mut map = json!({
            "privateKey": private_key,
            "publicKey": public_key,
            "serverAddress": "10.0.0.1",
            "serverPort": 51820,
            "allowedIPs": [],
            "dns": []
        });
        if let Some(psk) = psk {
            map["presharedKey"] = json!(psk);
        }
        TunnelConfig::from_value(&map).unwrap()
    }

    const PRIVATE: &str = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";
    const PEER: &str = "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=";

    #[test]
    fn test_load_derives_public_key() {
        let keys = KeyMaterial::load(&config_with(PRIVATE, PEER, None)).unwrap();
        let private = decode_key(PRIVATE, "k").unwrap();
        assert_eq!(keys.identity.public_key(), &x25519::public_key(&private));
        assert_eq!(encode_key(&keys.peer.public_key), PEER);
        assert!(keys.peer.preshared_key.is_none());
        assert_eq!(*keys.peer.psk_bytes(), [0u8; 32]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = KeyMaterial::load(&config_with("dG9vIHNob3J0", PEER, None)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { field } if field == "privateKey"));

        let err = KeyMaterial::load(&config_with(PRIVATE, "!!notbase64!!", None)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { field } if field == "publicKey"));
    }

    #[test]
    fn test_low_order_peer_key_rejected() {
        let zero = encode_key(&[0u8; 32]);
        let err = KeyMaterial::load(&config_with(PRIVATE, &zero, None)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { .. }));
    }

    #[test]
    fn test_preshared_key_length_checked() {
        let good = encode_key(&[7u8; 32]);
        let keys = KeyMaterial::load(&config_with(PRIVATE, PEER, Some(&good))).unwrap();
        assert_eq!(*keys.peer.psk_bytes(), [7u8; 32]);

        let short = BASE64.encode([7u8; 16]);
        let err = KeyMaterial::load(&config_with(PRIVATE, PEER, Some(&short))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { field } if field == "presharedKey"));
    }

    #[test]
    fn test_identity_zeroize() {
        let mut identity = Identity::from_private(&[3u8; 32]);
        assert!(!identity.is_wiped());
        identity.zeroize();
        assert!(identity.is_wiped());
    }

    #[test]
    fn test_identity_owns_its_copy_of_the_secret() {
        let mut secret = Zeroizing::new([3u8; 32]);
        let identity = Identity::from_private(&secret);
        secret.zeroize();

        assert_eq!(*identity.private_key(), [3u8; 32]);
        assert_eq!(*identity.public_key(), x25519::public_key(&[3u8; 32]));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let identity = Identity::from_private(&[3u8; 32]);
        let debug = format!("{:?}", identity);
        assert!(!debug.contains(&BASE64.encode([3u8; 32])));
    }
}
