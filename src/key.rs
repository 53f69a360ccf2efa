//! Triplet keys.
//!
//! A key joins the enabled components with `:` in the fixed order remote
//! address, sender, recipient. The address is written as its decimal integer
//! value so that `::ffff:192.0.2.1` and `192.0.2.1` collapse to one key.
//! Stores written by older versions hold the address in dotted-quad form;
//! [`current_form`] converts such keys.

use crate::config::GreylistConfig;
use crate::error::{Error, Result};
use lazy_regex::regex_is_match;
use std::net::{IpAddr, Ipv4Addr};

pub const DELIMITER: char = ':';

pub fn ip_to_int(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_bits()),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => u128::from(v4.to_bits()),
            None => v6.to_bits(),
        },
    }
}

/// Envelope addresses compare case-insensitively, without angle brackets.
/// Control characters are stripped, which keeps the store's tab and newline
/// separators out of keys. A `:` in a quoted local part is kept as is.
fn normalize_address(address: &str) -> String {
    let address = address.trim();
    let address = address
        .strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
        .unwrap_or(address);
    address
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .to_lowercase()
}

pub fn build_key(
    remote_ip: IpAddr,
    sender: &str,
    recipient: Option<&str>,
    config: &GreylistConfig,
) -> Result<String> {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    if config.remote_ip {
        parts.push(ip_to_int(remote_ip).to_string());
    }
    if config.sender {
        parts.push(normalize_address(sender));
    }
    if config.recipient {
        parts.push(normalize_address(recipient.unwrap_or("")));
    }
    if parts.is_empty() {
        return Err(Error::NoKeyComponentsConfigured);
    }
    Ok(parts.join(&DELIMITER.to_string()))
}

/// Rewrite a key whose leading component is a dotted quad into the integer
/// form. Returns `None` when the key is already current.
pub fn current_form(key: &str) -> Option<String> {
    let (first, rest) = match key.split_once(DELIMITER) {
        Some((first, rest)) => (first, Some(rest)),
        None => (key, None),
    };
    if !regex_is_match!(r"^\d{1,3}(?:\.\d{1,3}){3}$", first) {
        return None;
    }
    let ip: Ipv4Addr = first.parse().ok()?;
    let converted = ip.to_bits().to_string();
    Some(match rest {
        Some(rest) => format!("{converted}{DELIMITER}{rest}"),
        None => converted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(remote_ip: bool, sender: bool, recipient: bool) -> GreylistConfig {
        GreylistConfig {
            remote_ip,
            sender,
            recipient,
            ..Default::default()
        }
    }

    #[test]
    fn test_address_forms_collapse() {
        let c = config(true, false, false);
        let v4 = build_key("192.0.2.1".parse().unwrap(), "", None, &c).unwrap();
        let mapped = build_key("::ffff:192.0.2.1".parse().unwrap(), "", None, &c).unwrap();
        assert_eq!(v4, "3221225985");
        assert_eq!(v4, mapped);
        let v6 = build_key("2001:db8::1".parse().unwrap(), "", None, &c).unwrap();
        assert_eq!(v6, "42540766411282592856903984951653826561");
    }

    #[test]
    fn test_component_order_and_case() {
        let c = config(true, true, true);
        let key = build_key(
            "10.0.0.1".parse().unwrap(),
            "<Alice@Example.ORG>",
            Some("bob@example.net"),
            &c,
        )
        .unwrap();
        assert_eq!(key, "167772161:alice@example.org:bob@example.net");

        let c = config(false, true, false);
        let key = build_key("10.0.0.1".parse().unwrap(), "", None, &c).unwrap();
        assert_eq!(key, "");
    }

    #[test]
    fn test_control_characters_stripped() {
        let c = config(false, true, true);
        let key = build_key(
            "10.0.0.1".parse().unwrap(),
            "a\tb@example.org\n",
            Some("<c@\rexample.net>"),
            &c,
        )
        .unwrap();
        assert_eq!(key, "ab@example.org:c@example.net");
    }

    #[test]
    fn test_no_components() {
        let c = config(false, false, false);
        let r = build_key("10.0.0.1".parse().unwrap(), "a@b", Some("c@d"), &c);
        assert!(matches!(r, Err(Error::NoKeyComponentsConfigured)));
    }

    #[test]
    fn test_current_form() {
        assert_eq!(current_form("10.0.0.1").as_deref(), Some("167772161"));
        assert_eq!(
            current_form("10.0.0.1:a@b:c@d").as_deref(),
            Some("167772161:a@b:c@d")
        );
        assert_eq!(current_form("167772161:a@b"), None);
        assert_eq!(current_form("a@b:c@d"), None);
        assert_eq!(current_form("999.0.0.1"), None);
    }
}
