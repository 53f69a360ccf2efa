//! Greylisting options: defaults, the recognized option set and the
//! per-recipient overlay.

use crate::read_array;
use lazy_regex::regex_is_match;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_BLACK_TIMEOUT: u64 = 50 * 60;
pub const DEFAULT_GREY_TIMEOUT: u64 = 3 * 60 * 60 + 20 * 60;
pub const DEFAULT_WHITE_TIMEOUT: u64 = 36 * 24 * 60 * 60;

/// Effective configuration for one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreylistConfig {
    pub remote_ip: bool,
    pub sender: bool,
    pub recipient: bool,
    /// Seconds after first contact during which retries are still deferred.
    pub black_timeout: u64,
    /// Seconds after first contact until which a retry promotes the triplet.
    pub grey_timeout: u64,
    /// Sliding trust window in seconds, renewed on every accepted delivery.
    pub white_timeout: u64,
    pub reject: bool,
    pub deny_late: bool,
    pub db_dir: Option<PathBuf>,
    pub per_recipient: bool,
    pub per_recipient_db: bool,
    pub nfslock: bool,
    pub p0f: Vec<String>,
    pub geoip: Vec<String>,
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            remote_ip: true,
            sender: false,
            recipient: false,
            black_timeout: DEFAULT_BLACK_TIMEOUT,
            grey_timeout: DEFAULT_GREY_TIMEOUT,
            white_timeout: DEFAULT_WHITE_TIMEOUT,
            reject: true,
            deny_late: false,
            db_dir: None,
            per_recipient: false,
            per_recipient_db: false,
            nfslock: false,
            p0f: Vec::new(),
            geoip: Vec::new(),
        }
    }
}

impl GreylistConfig {
    /// Read a config file on top of the defaults. Invalid lines are
    /// logged and returned, not fatal.
    pub fn load(path: &Path) -> std::io::Result<(Self, Vec<InvalidOption>)> {
        let (overrides, invalid) = Overrides::load(path)?;
        report_invalid(&path.display().to_string(), &invalid);
        let config = merge(&Self::default(), &overrides);
        if config.black_timeout >= config.grey_timeout {
            warn!(
                black_timeout = config.black_timeout,
                grey_timeout = config.grey_timeout,
                "black_timeout should be lower than grey_timeout, promotion window is empty"
            );
        }
        Ok((config, invalid))
    }

    /// Recipient-level checks replace the MAIL FROM check when the recipient
    /// is part of the key or recipients carry their own configuration.
    pub fn checks_at_rcpt(&self) -> bool {
        self.recipient || self.per_recipient
    }
}

/// The allow-list of option names. Anything else is reported and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionName {
    RemoteIp,
    Sender,
    Recipient,
    BlackTimeout,
    GreyTimeout,
    WhiteTimeout,
    Reject,
    DenyLate,
    DbDir,
    PerRecipient,
    PerRecipientDb,
    NfsLock,
    P0f,
    Geoip,
}

impl OptionName {
    pub const ALL: [OptionName; 14] = [
        OptionName::RemoteIp,
        OptionName::Sender,
        OptionName::Recipient,
        OptionName::BlackTimeout,
        OptionName::GreyTimeout,
        OptionName::WhiteTimeout,
        OptionName::Reject,
        OptionName::DenyLate,
        OptionName::DbDir,
        OptionName::PerRecipient,
        OptionName::PerRecipientDb,
        OptionName::NfsLock,
        OptionName::P0f,
        OptionName::Geoip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionName::RemoteIp => "remote_ip",
            OptionName::Sender => "sender",
            OptionName::Recipient => "recipient",
            OptionName::BlackTimeout => "black_timeout",
            OptionName::GreyTimeout => "grey_timeout",
            OptionName::WhiteTimeout => "white_timeout",
            OptionName::Reject => "reject",
            OptionName::DenyLate => "deny_late",
            OptionName::DbDir => "db_dir",
            OptionName::PerRecipient => "per_recipient",
            OptionName::PerRecipientDb => "per_recipient_db",
            OptionName::NfsLock => "nfslock",
            OptionName::P0f => "p0f",
            OptionName::Geoip => "geoip",
        }
    }

    fn parse_value(&self, raw: &str) -> Result<Setting, String> {
        let seconds = || {
            raw.parse::<u64>()
                .map_err(|_| "expected a number of seconds".to_string())
        };
        let flag = || parse_bool(raw).ok_or_else(|| "expected a boolean".to_string());
        let list = || -> Vec<String> {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };
        Ok(match self {
            OptionName::RemoteIp => Setting::RemoteIp(flag()?),
            OptionName::Sender => Setting::Sender(flag()?),
            OptionName::Recipient => Setting::Recipient(flag()?),
            OptionName::BlackTimeout => Setting::BlackTimeout(seconds()?),
            OptionName::GreyTimeout => Setting::GreyTimeout(seconds()?),
            OptionName::WhiteTimeout => Setting::WhiteTimeout(seconds()?),
            OptionName::Reject => Setting::Reject(flag()?),
            OptionName::DenyLate => Setting::DenyLate(flag()?),
            OptionName::DbDir => {
                if !regex_is_match!(r"^[-a-zA-Z0-9./_]+$", raw) {
                    return Err("directory name contains unsupported characters".to_string());
                }
                Setting::DbDir(PathBuf::from(raw))
            }
            OptionName::PerRecipient => Setting::PerRecipient(flag()?),
            OptionName::PerRecipientDb => Setting::PerRecipientDb(flag()?),
            OptionName::NfsLock => Setting::NfsLock(flag()?),
            OptionName::P0f => Setting::P0f(list()),
            OptionName::Geoip => Setting::Geoip(list()),
        })
    }
}

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OptionName::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// One validated option with its typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    RemoteIp(bool),
    Sender(bool),
    Recipient(bool),
    BlackTimeout(u64),
    GreyTimeout(u64),
    WhiteTimeout(u64),
    Reject(bool),
    DenyLate(bool),
    DbDir(PathBuf),
    PerRecipient(bool),
    PerRecipientDb(bool),
    NfsLock(bool),
    P0f(Vec<String>),
    Geoip(Vec<String>),
}

/// A rejected `name value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidOption {
    pub name: String,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for InvalidOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}: {}", self.name, self.value, self.reason)
    }
}

pub fn report_invalid(origin: &str, invalid: &[InvalidOption]) {
    for option in invalid {
        warn!(origin, "ignoring invalid greylisting option {option}");
    }
}

/// Validated options, applied in order on top of a base configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides(Vec<Setting>);

impl Overrides {
    pub fn parse<'a, I>(pairs: I) -> (Self, Vec<InvalidOption>)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for (name, value) in pairs {
            let reject = |reason: &str| InvalidOption {
                name: name.to_string(),
                value: value.to_string(),
                reason: reason.to_string(),
            };
            match name.parse::<OptionName>() {
                Err(()) => invalid.push(reject("unknown option")),
                Ok(option) => match option.parse_value(value) {
                    Ok(setting) => valid.push(setting),
                    Err(reason) => invalid.push(reject(&reason)),
                },
            }
        }
        (Self(valid), invalid)
    }

    /// Parse `name value` lines as produced by [`read_array`].
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> (Self, Vec<InvalidOption>) {
        Self::parse(lines.iter().map(|line| {
            let line = line.as_ref().trim();
            match line.split_once(char::is_whitespace) {
                Some((name, value)) => (name, value.trim()),
                None => (line, ""),
            }
        }))
    }

    pub fn load(path: &Path) -> std::io::Result<(Self, Vec<InvalidOption>)> {
        Ok(Self::from_lines(&read_array(path)?))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Produce the effective configuration for one decision. `base` is left
/// untouched.
pub fn merge(base: &GreylistConfig, overrides: &Overrides) -> GreylistConfig {
    let mut config = base.clone();
    for setting in &overrides.0 {
        match setting.clone() {
            Setting::RemoteIp(b) => config.remote_ip = b,
            Setting::Sender(b) => config.sender = b,
            Setting::Recipient(b) => config.recipient = b,
            Setting::BlackTimeout(s) => config.black_timeout = s,
            Setting::GreyTimeout(s) => config.grey_timeout = s,
            Setting::WhiteTimeout(s) => config.white_timeout = s,
            Setting::Reject(b) => config.reject = b,
            Setting::DenyLate(b) => config.deny_late = b,
            Setting::DbDir(p) => config.db_dir = Some(p),
            Setting::PerRecipient(b) => config.per_recipient = b,
            Setting::PerRecipientDb(b) => config.per_recipient_db = b,
            Setting::NfsLock(b) => config.nfslock = b,
            Setting::P0f(l) => config.p0f = l,
            Setting::Geoip(l) => config.geoip = l,
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GreylistConfig::default();
        assert!(config.remote_ip && !config.sender && !config.recipient);
        assert_eq!(config.black_timeout, 3000);
        assert_eq!(config.grey_timeout, 12000);
        assert_eq!(config.white_timeout, 3_110_400);
        assert!(config.reject);
        assert!(!config.checks_at_rcpt());
    }

    #[test]
    fn test_unknown_and_malformed_options_are_reported() {
        let (overrides, invalid) = Overrides::from_lines(&[
            "sender 1",
            "black_timeout soon",
            "loglevel 6",
            "db_dir /var/lib/grey list",
            "geoip US, CN ,",
        ]);
        let names: Vec<_> = invalid.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["black_timeout", "loglevel", "db_dir"]);
        let config = merge(&GreylistConfig::default(), &overrides);
        assert!(config.sender);
        assert_eq!(config.black_timeout, DEFAULT_BLACK_TIMEOUT);
        assert_eq!(config.geoip, ["US", "CN"]);
        assert_eq!(config.db_dir, None);
    }

    #[test]
    fn test_merge_leaves_base_untouched() {
        let base = GreylistConfig::default();
        let (overrides, invalid) = Overrides::parse([("recipient", "yes"), ("reject", "off")]);
        assert!(invalid.is_empty());
        let merged = merge(&base, &overrides);
        assert!(merged.recipient && !merged.reject);
        assert!(merged.checks_at_rcpt());
        assert_eq!(base, GreylistConfig::default());
    }

    #[test]
    fn test_later_lines_win() {
        let (overrides, _) = Overrides::parse([("grey_timeout", "100"), ("grey_timeout", "200")]);
        assert_eq!(merge(&GreylistConfig::default(), &overrides).grey_timeout, 200);
    }
}
