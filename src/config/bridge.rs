//! Validation of the bridge's dynamically-typed config map
//!
//! Field checks run in the same order the mobile bridges used, so the first
//! reported problem is the one those callers already expect.

use serde_json::{Map, Value};
use zeroize::Zeroizing;

use super::{parse_cidr, parse_ip, push_unique, TunnelConfig, DEFAULT_MTU};
use crate::error::ConfigError;

pub(super) fn parse_map(value: &Value) -> Result<TunnelConfig, ConfigError> {
    let map = value.as_object().ok_or_else(|| ConfigError::InvalidField {
        field: "config".to_string(),
        reason: "expected an object".to_string(),
    })?;

    let private_key = Zeroizing::new(required_string(map, "privateKey")?);
    let public_key = required_string(map, "publicKey")?;
    let server_address = required_string(map, "serverAddress")?;
    let server_port = port(map)?;

    let mut allowed_ips = Vec::new();
    for entry in required_strings(map, "allowedIPs")? {
        push_unique(&mut allowed_ips, parse_cidr(entry)?);
    }

    let dns = required_strings(map, "dns")?
        .into_iter()
        .map(parse_ip)
        .collect::<Result<Vec<_>, _>>()?;

    let mtu = match present(map, "mtu") {
        None => DEFAULT_MTU,
        Some(v) => v
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid("mtu", "expected an integer between 1 and 65535"))?,
    };

    let preshared_key = match present(map, "presharedKey") {
        None => None,
        Some(v) => Some(Zeroizing::new(
            v.as_str()
                .ok_or_else(|| invalid("presharedKey", "expected a string"))?
                .to_string(),
        )),
    };

    Ok(TunnelConfig {
        private_key,
        public_key,
        server_address,
        server_port,
        allowed_ips,
        dns,
        mtu,
        preshared_key,
    })
}

/// A key whose value is JSON `null` counts as absent
fn present<'a>(map: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    map.get(field).filter(|v| !v.is_null())
}

fn missing(field: &str) -> ConfigError {
    ConfigError::MissingField {
        field: field.to_string(),
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn required_string(map: &Map<String, Value>, field: &str) -> Result<String, ConfigError> {
    let value = present(map, field).ok_or_else(|| missing(field))?;
    let text = value
        .as_str()
        .ok_or_else(|| invalid(field, "expected a string"))?
        .trim();
    if text.is_empty() {
        return Err(missing(field));
    }
    Ok(text.to_string())
}

fn required_strings<'a>(
    map: &'a Map<String, Value>,
    field: &str,
) -> Result<Vec<&'a str>, ConfigError> {
    let items = present(map, field)
        .ok_or_else(|| missing(field))?
        .as_array()
        .ok_or_else(|| invalid(field, "expected an array of strings"))?;

    items
        .iter()
        .map(|item| {
            item.as_str()
                .ok_or_else(|| invalid(field, "expected an array of strings"))
        })
        .collect()
}

fn port(map: &Map<String, Value>) -> Result<u16, ConfigError> {
    let value = present(map, "serverPort").ok_or_else(|| missing("serverPort"))?;
    value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| invalid("serverPort", "expected an integer between 0 and 65535"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "privateKey": "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=",
            "publicKey": "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=",
            "serverAddress": "10.0.0.1",
            "serverPort": 51820,
            "allowedIPs": ["0.0.0.0/0"],
            "dns": ["1.1.1.1"]
        })
    }

    fn without(field: &str) -> Value {
        let mut value = valid();
        value.as_object_mut().unwrap().remove(field);
        value
    }

    #[test]
    fn test_valid_map() {
        let config = parse_map(&valid()).unwrap();
        assert_eq!(config.server_address, "10.0.0.1");
        assert_eq!(config.server_port, 51820);
        assert_eq!(config.allowed_ips.len(), 1);
        assert_eq!(config.dns[0].to_string(), "1.1.1.1");
        assert_eq!(config.mtu, 1420);
        assert!(config.preshared_key.is_none());
    }

    #[test]
    fn test_each_required_field_reports_its_name() {
        for field in [
            "privateKey",
            "publicKey",
            "serverAddress",
            "serverPort",
            "allowedIPs",
            "dns",
        ] {
            let err = parse_map(&without(field)).unwrap_err();
            assert_eq!(err.to_string(), format!("Missing '{}'", field));
        }
    }

    #[test]
    fn test_null_counts_as_missing() {
        let mut value = valid();
        value["publicKey"] = Value::Null;
        assert_eq!(
            parse_map(&value).unwrap_err().to_string(),
            "Missing 'publicKey'"
        );
    }

    #[test]
    fn test_first_missing_field_wins() {
        let mut value = without("serverPort");
        value.as_object_mut().unwrap().remove("dns");
        assert_eq!(
            parse_map(&value).unwrap_err().to_string(),
            "Missing 'serverPort'"
        );
    }

    #[test]
    fn test_empty_lists_allowed() {
        let mut value = valid();
        value["allowedIPs"] = json!([]);
        value["dns"] = json!([]);
        let config = parse_map(&value).unwrap();
        assert!(config.allowed_ips.is_empty());
        assert!(config.dns.is_empty());
    }

    #[test]
    fn test_port_bounds() {
        let mut value = valid();
        value["serverPort"] = json!(65536);
        assert!(matches!(
            parse_map(&value),
            Err(ConfigError::InvalidField { .. })
        ));

        value["serverPort"] = json!(-1);
        assert!(parse_map(&value).is_err());

        value["serverPort"] = json!("51820");
        assert!(parse_map(&value).is_err());

        value["serverPort"] = json!(0);
        assert_eq!(parse_map(&value).unwrap().server_port, 0);
    }

    #[test]
    fn test_allowed_ips_deduplicated_in_order() {
        let mut value = valid();
        value["allowedIPs"] = json!(["10.0.0.0/8", "0.0.0.0/0", "10.0.0.0/8"]);
        let config = parse_map(&value).unwrap();
        let nets: Vec<String> = config.allowed_ips.iter().map(|n| n.to_string()).collect();
        assert_eq!(nets, vec!["10.0.0.0/8", "0.0.0.0/0"]);
    }

    #[test]
    fn test_bad_entries_rejected() {
        let mut value = valid();
        value["allowedIPs"] = json!(["not-a-cidr"]);
        assert!(matches!(
            parse_map(&value),
            Err(ConfigError::InvalidCidr { .. })
        ));

        let mut value = valid();
        value["dns"] = json!(["one.one.one.one"]);
        assert!(matches!(
            parse_map(&value),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_optional_fields() {
        let mut value = valid();
        value["mtu"] = json!(1280);
        value["presharedKey"] = json!("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        let config = parse_map(&value).unwrap();
        assert_eq!(config.mtu, 1280);
        assert!(config.preshared_key.is_some());

        value["mtu"] = json!(0);
        assert!(parse_map(&value).is_err());
    }

    #[test]
    fn test_not_an_object() {
        assert!(parse_map(&json!(["privateKey"])).is_err());
    }
}
