//! Bypass signals that exempt a connection from greylisting.
//!
//! The signals themselves come from elsewhere (SMTP AUTH, allowlists, TLS,
//! fingerprint and geo lookups). This module only decides, in a fixed order,
//! whether any of them grants immunity.

use crate::config::GreylistConfig;
use lazy_regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Passive OS fingerprint attributes, e.g. `genre => "Windows"`.
pub type Fingerprint = HashMap<String, String>;

pub trait FingerprintLookup: Send + Sync {
    fn fingerprint(&self, ip: IpAddr) -> Option<Fingerprint>;
}

pub trait GeoLookup: Send + Sync {
    /// ISO country code of the address.
    fn country(&self, ip: IpAddr) -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSignals {
    pub relay_client: bool,
    pub allowlisted_host: bool,
    pub allowlisted_sender: bool,
    pub tls: bool,
    pub fingerprint: Option<Fingerprint>,
    pub country: Option<String>,
}

const FINGERPRINT_KEYS: [&str; 5] = ["genre", "detail", "uptime", "link", "distance"];

/// `p0f` is a flat `key,value,key,value` list. The connection matches when
/// any configured value matches its attribute (case-insensitive regex), or
/// for `distance` when the observed hop count exceeds the value.
fn fingerprint_matches(criteria: &[String], fingerprint: &Fingerprint) -> bool {
    for pair in criteria.chunks(2) {
        let [key, wanted] = pair else {
            warn!(key = %pair[0], "p0f criterion without a value");
            continue;
        };
        if !FINGERPRINT_KEYS.contains(&key.as_str()) {
            warn!(key = %key, "discarding invalid p0f match key");
            continue;
        }
        let Some(observed) = fingerprint.get(key) else {
            continue;
        };
        if key == "distance" {
            if let (Ok(observed), Ok(wanted)) = (observed.parse::<u32>(), wanted.parse::<u32>())
                && observed > wanted
            {
                debug!(observed, wanted, "p0f distance matched");
                return true;
            }
            continue;
        }
        match Regex::new(&format!("(?i){wanted}")) {
            Ok(re) if re.is_match(observed) => {
                debug!(key = %key, wanted = %wanted, "p0f matched");
                return true;
            }
            Ok(_) => (),
            Err(e) => warn!(key = %key, "bad p0f pattern: {e}"),
        }
    }
    false
}

fn country_skipped(skip: &[String], country: &str) -> bool {
    skip.iter().any(|c| c.eq_ignore_ascii_case(country))
}

/// First matching signal wins. Fingerprint criteria select the connections
/// that are subject to greylisting, so without a match the connection is
/// immune.
pub fn is_immune(signals: &ConnectionSignals, config: &GreylistConfig) -> bool {
    if signals.relay_client {
        info!("skip: relay client");
        return true;
    }
    if signals.allowlisted_host {
        info!("skip: allowlisted host");
        return true;
    }
    if signals.allowlisted_sender {
        info!("skip: allowlisted sender");
        return true;
    }
    if signals.tls {
        info!("skip: TLS session");
        return true;
    }
    if !config.p0f.is_empty() {
        let matched = match &signals.fingerprint {
            Some(fp) => fingerprint_matches(&config.p0f, fp),
            None => {
                debug!("no p0f fingerprint for connection");
                false
            }
        };
        if !matched {
            info!("skip: p0f fingerprint does not match");
            return true;
        }
    }
    if !config.geoip.is_empty() {
        match signals.country.as_deref() {
            Some(country) if country_skipped(&config.geoip, country) => {
                info!(country, "skip: country");
                return true;
            }
            Some(_) => (),
            None => debug!("no geoip country for connection"),
        }
    }
    false
}
