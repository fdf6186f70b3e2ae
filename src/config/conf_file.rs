//! WireGuard `.conf` import/export
//!
//! Only the subset that maps onto [`TunnelConfig`] is understood: one
//! `[Interface]` and one `[Peer]`. Unknown keys are skipped.

use std::fmt::Write as _;

use zeroize::Zeroizing;

use super::{parse_cidr, parse_ip, push_unique, TunnelConfig, DEFAULT_MTU};
use crate::error::ConfigError;

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct Builder {
    private_key: Option<Zeroizing<String>>,
    public_key: Option<String>,
    endpoint: Option<(String, u16)>,
    allowed_ips: Vec<ipnet::IpNet>,
    dns: Vec<std::net::IpAddr>,
    mtu: Option<u16>,
    preshared_key: Option<Zeroizing<String>>,
}

pub(super) fn parse(content: &str) -> Result<TunnelConfig, ConfigError> {
    let mut builder = Builder::default();
    let mut section: Option<Section> = None;
    let mut peers_seen = 0usize;

    for (idx, raw) in content.lines().enumerate() {
        let line_num = idx + 1;
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        if line.eq_ignore_ascii_case("[interface]") {
            section = Some(Section::Interface);
            continue;
        }
        if line.eq_ignore_ascii_case("[peer]") {
            peers_seen += 1;
            if peers_seen > 1 {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: "Only one [Peer] section is supported".to_string(),
                });
            }
            section = Some(Section::Peer);
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::ParseError {
                line: line_num,
                message: format!("Expected 'key = value', got: {}", line),
            });
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match (section, key.as_str()) {
            (None, _) => {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: "Configuration value outside of any section".to_string(),
                });
            }
            (Some(Section::Interface), "privatekey") => {
                builder.private_key = Some(Zeroizing::new(value.to_string()));
            }
            (Some(Section::Interface), "mtu") => {
                let mtu = value
                    .parse::<u16>()
                    .ok()
                    .filter(|&m| m > 0)
                    .ok_or_else(|| ConfigError::ParseError {
                        line: line_num,
                        message: format!("Invalid MTU: {}", value),
                    })?;
                builder.mtu = Some(mtu);
            }
            // The Android bridge emitted DNS under [Peer]; accept it in either place.
            (Some(_), "dns") => {
                for entry in value.split(',').filter(|s| !s.trim().is_empty()) {
                    builder.dns.push(parse_ip(entry)?);
                }
            }
            (Some(Section::Peer), "publickey") => {
                builder.public_key = Some(value.to_string());
            }
            (Some(Section::Peer), "presharedkey") => {
                builder.preshared_key = Some(Zeroizing::new(value.to_string()));
            }
            (Some(Section::Peer), "endpoint") => {
                builder.endpoint = Some(split_endpoint(value).ok_or_else(|| {
                    ConfigError::ParseError {
                        line: line_num,
                        message: format!("Invalid Endpoint: {}", value),
                    }
                })?);
            }
            (Some(Section::Peer), "allowedips") => {
                for entry in value.split(',').filter(|s| !s.trim().is_empty()) {
                    push_unique(&mut builder.allowed_ips, parse_cidr(entry)?);
                }
            }
            (Some(_), other) => {
                tracing::debug!("Ignoring unsupported .conf key: {}", other);
            }
        }
    }

    let missing = |field: &str| ConfigError::MissingField {
        field: field.to_string(),
    };
    let (server_address, server_port) = builder.endpoint.ok_or_else(|| missing("serverAddress"))?;

    Ok(TunnelConfig {
        private_key: builder.private_key.ok_or_else(|| missing("privateKey"))?,
        public_key: builder.public_key.ok_or_else(|| missing("publicKey"))?,
        server_address,
        server_port,
        allowed_ips: builder.allowed_ips,
        dns: builder.dns,
        mtu: builder.mtu.unwrap_or(DEFAULT_MTU),
        preshared_key: builder.preshared_key,
    })
}

/// Split `host:port` / `[v6]:port` at the last colon
fn split_endpoint(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(super) fn render(config: &TunnelConfig) -> String {
    let mut out = String::new();

    // Writing into a String cannot fail
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", config.private_key.as_str());
    let _ = writeln!(out, "MTU = {}", config.mtu);
    if !config.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", join(&config.dns));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", config.public_key);
    if let Some(psk) = &config.preshared_key {
        let _ = writeln!(out, "PresharedKey = {}", psk.as_str());
    }
    let _ = writeln!(out, "Endpoint = {}", config.endpoint());
    let _ = writeln!(out, "AllowedIPs = {}", join(&config.allowed_ips));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Address = 10.0.0.2/24
DNS = 8.8.8.8, 1.1.1.1
MTU = 1380

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
AllowedIPs = 10.0.0.0/24, 0.0.0.0/0
Endpoint = vpn.example.com:51820  # trailing comment
PersistentKeepalive = 25
"#;

    #[test]
    fn test_parse_conf() {
        let config = parse(TEST_CONFIG).unwrap();
        assert_eq!(config.server_address, "vpn.example.com");
        assert_eq!(config.server_port, 51820);
        assert_eq!(config.mtu, 1380);
        assert_eq!(config.dns.len(), 2);
        assert_eq!(config.allowed_ips.len(), 2);
        assert!(config.preshared_key.is_none());
    }

    #[test]
    fn test_render_then_parse_preserves_fields() {
        let mut config = parse(TEST_CONFIG).unwrap();
        config.server_address = "2001:db8::1".to_string();
        config.preshared_key = Some(Zeroizing::new(
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
        ));

        let text = render(&config);
        assert!(text.contains("Endpoint = [2001:db8::1]:51820"));

        let reparsed = parse(&text).unwrap();
        assert_eq!(reparsed.server_address, "2001:db8::1");
        assert_eq!(reparsed.dns, config.dns);
        assert_eq!(reparsed.allowed_ips, config.allowed_ips);
        assert_eq!(reparsed.mtu, config.mtu);
        assert!(reparsed.preshared_key.is_some());
    }

    #[test]
    fn test_dns_under_peer_accepted() {
        let text = "[Interface]\nPrivateKey = a\n[Peer]\nPublicKey = b\nEndpoint = 1.2.3.4:1\nDNS = 9.9.9.9\n";
        assert_eq!(parse(text).unwrap().dns[0].to_string(), "9.9.9.9");
    }

    #[test]
    fn test_missing_endpoint() {
        let text = "[Interface]\nPrivateKey = a\n[Peer]\nPublicKey = b\n";
        assert_eq!(
            parse(text).unwrap_err().to_string(),
            "Missing 'serverAddress'"
        );
    }

    #[test]
    fn test_multiple_peers_rejected() {
        let text = "[Interface]\nPrivateKey = a\n[Peer]\nPublicKey = b\n[Peer]\nPublicKey = c\n";
        assert!(matches!(
            parse(text),
            Err(ConfigError::ParseError { line: 5, .. })
        ));
    }

    #[test]
    fn test_value_outside_section() {
        assert!(matches!(
            parse("PrivateKey = a\n"),
            Err(ConfigError::ParseError { line: 1, .. })
        ));
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(
            split_endpoint("[::1]:51820"),
            Some(("::1".to_string(), 51820))
        );
        assert_eq!(split_endpoint(":51820"), None);
        assert_eq!(split_endpoint("host:notaport"), None);
    }
}
