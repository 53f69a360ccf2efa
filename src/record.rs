//! Persisted greylist record: `timestamp:1:black_count:white_count`.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Creation time while black, time of the last accepted delivery while white.
    pub timestamp: u64,
    pub black_count: u64,
    pub white_count: u64,
}

impl Record {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            black_count: 0,
            white_count: 0,
        }
    }

    /// Seconds since the stored timestamp. A timestamp in the future counts as zero.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }
}

/// The second field is a legacy "new entry" flag, always written as `1`.
impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:1:{}:{}",
            self.timestamp, self.black_count, self.white_count
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRecordError(pub String);

impl fmt::Display for ParseRecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed greylist record {:?}", self.0)
    }
}

impl std::error::Error for ParseRecordError {}

impl FromStr for Record {
    type Err = ParseRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRecordError(s.to_string());
        let fields: Vec<u64> = s
            .split(':')
            .map(|f| f.trim().parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| err())?;
        match fields[..] {
            [timestamp, _new, black_count, white_count] => Ok(Self {
                timestamp,
                black_count,
                white_count,
            }),
            _ => Err(err()),
        }
    }
}

#[test]
fn test_encoding() {
    let r = Record {
        timestamp: 1700000000,
        black_count: 3,
        white_count: 7,
    };
    assert_eq!(r.to_string(), "1700000000:1:3:7");
    assert_eq!("1700000000:1:3:7".parse::<Record>().unwrap(), r);
}

#[test]
fn test_malformed() {
    for bad in ["", "1:1:1", "1:1:1:1:1", "a:1:0:0", "1700000000:1:-1:0"] {
        assert!(bad.parse::<Record>().is_err(), "{bad:?}");
    }
}

#[test]
fn test_age_saturates() {
    let r = Record::new(100);
    assert_eq!(r.age(160), 60);
    assert_eq!(r.age(50), 0);
}
