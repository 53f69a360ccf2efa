//! Host and address allowlists read from list files.
//!
//! Host entries are addresses, or prefixes ending in `.` or `:` such as
//! `192.0.2.` or `2001:db8:`. Address entries are full addresses, `@domain`
//! or a bare domain.

use crate::{array_contains, read_array};
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    entries: Vec<String>,
}

impl Allowlist {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| e.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(&read_array(path)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_host(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
            v4 => v4,
        };
        let text = ip.to_string();
        array_contains(&self.entries, &text)
            || self
                .entries
                .iter()
                .any(|e| (e.ends_with('.') || e.ends_with(':')) && text.starts_with(e.as_str()))
    }

    pub fn contains_address(&self, address: &str) -> bool {
        let address = address
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_lowercase();
        if address.is_empty() {
            return false;
        }
        if array_contains(&self.entries, &address) {
            return true;
        }
        match address.rsplit_once('@') {
            Some((_, domain)) => self
                .entries
                .iter()
                .any(|e| e.strip_prefix('@').unwrap_or(e) == domain),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Allowlists {
    pub hosts: Allowlist,
    pub senders: Allowlist,
    pub recipients: Allowlist,
}

#[test]
fn test_hosts() {
    let list = Allowlist::new(&["192.0.2.7", "198.51.100.", "2001:DB8:"]);
    assert!(list.contains_host("192.0.2.7".parse().unwrap()));
    assert!(!list.contains_host("192.0.2.70".parse().unwrap()));
    assert!(list.contains_host("198.51.100.9".parse().unwrap()));
    assert!(list.contains_host("::ffff:198.51.100.9".parse().unwrap()));
    assert!(list.contains_host("2001:db8::25".parse().unwrap()));
    assert!(!list.contains_host("203.0.113.1".parse().unwrap()));
}

#[test]
fn test_addresses() {
    let list = Allowlist::new(&["Postmaster@example.org", "@example.net", "example.com"]);
    assert!(list.contains_address("<postmaster@EXAMPLE.org>"));
    assert!(!list.contains_address("abuse@example.org"));
    assert!(list.contains_address("anyone@example.net"));
    assert!(list.contains_address("anyone@example.com"));
    assert!(!list.contains_address("anyone@sub.example.com"));
    assert!(!list.contains_address(""));
}
