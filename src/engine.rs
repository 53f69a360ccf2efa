//! The greylisting state machine.
//!
//! The state of a triplet is never stored. It is derived from the record and
//! the current time on every decision:
//!
//! | state   | condition (age = now - timestamp)            | outcome                            |
//! |---------|----------------------------------------------|------------------------------------|
//! | Unknown | no record                                    | create `(now,0,0)`, defer          |
//! | White   | `white > 0 && age < white_timeout`           | `timestamp = now, white += 1`, accept |
//! | Black   | `age < black_timeout`                        | `black += 1`, defer                |
//! | Grey    | `age < grey_timeout`                         | `timestamp = now, white = 1`, accept |
//! | Expired | past every window                            | accept, record left as it is       |
//!
//! An expired record is not reset. It stays until pruning removes it and
//! keeps answering accept in the meantime.

use crate::config::GreylistConfig;
use crate::record::Record;
use crate::store::LockedStore;
use std::fmt;
use tracing::info;

pub const DEFER_MESSAGE: &str = "This mail is temporarily denied";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Defer(String),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Accept => f.write_str("ACCEPT"),
            Decision::Defer(msg) => write!(f, "DEFER ({msg})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unknown,
    Black,
    Grey,
    White,
    Expired,
}

impl State {
    pub fn of(record: Option<&Record>, now: u64, config: &GreylistConfig) -> Self {
        let Some(record) = record else {
            return State::Unknown;
        };
        let age = record.age(now);
        if record.white_count > 0 && age < config.white_timeout {
            State::White
        } else if age < config.black_timeout {
            State::Black
        } else if age < config.grey_timeout {
            State::Grey
        } else {
            State::Expired
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Unknown => "unknown",
            State::Black => "black",
            State::Grey => "grey",
            State::White => "white",
            State::Expired => "expired",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: State,
    pub defer: bool,
    /// Record to write back, `None` leaves the store untouched.
    pub update: Option<Record>,
}

pub fn transition(record: Option<Record>, now: u64, config: &GreylistConfig) -> Transition {
    let state = State::of(record.as_ref(), now, config);
    let (defer, update) = match (state, record) {
        (State::Unknown, _) | (_, None) => (true, Some(Record::new(now))),
        (State::White, Some(r)) => (
            false,
            Some(Record {
                timestamp: now,
                white_count: r.white_count.saturating_add(1),
                ..r
            }),
        ),
        (State::Black, Some(r)) => (
            true,
            Some(Record {
                black_count: r.black_count.saturating_add(1),
                ..r
            }),
        ),
        (State::Grey, Some(r)) => (
            false,
            Some(Record {
                timestamp: now,
                white_count: 1,
                ..r
            }),
        ),
        (State::Expired, Some(_)) => (false, None),
    };
    Transition {
        state,
        defer,
        update,
    }
}

/// Read, decide and write one key. The caller holds the lock and commits.
///
/// With `reject` off a deferral is reported as accept, but the record is
/// still updated.
pub fn decide(store: &mut LockedStore, key: &str, now: u64, config: &GreylistConfig) -> Decision {
    let t = transition(store.get(key), now, config);
    if let Some(record) = t.update {
        store.put(key, record);
    }
    let counts = t.update.or_else(|| store.get(key));
    info!(
        key,
        state = %t.state,
        black = counts.map(|r| r.black_count),
        white = counts.map(|r| r.white_count),
        defer = t.defer,
        "greylist"
    );
    match (t.defer, config.reject) {
        (false, _) => Decision::Accept,
        (true, true) => Decision::Defer(DEFER_MESSAGE.to_string()),
        (true, false) => {
            info!(key, "reject disabled, accepting deferred triplet");
            Decision::Accept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 60;

    fn config() -> GreylistConfig {
        GreylistConfig {
            black_timeout: 50 * MIN,
            grey_timeout: 200 * MIN,
            white_timeout: 36 * 24 * 60 * MIN,
            ..Default::default()
        }
    }

    fn rec(timestamp: u64, black_count: u64, white_count: u64) -> Record {
        Record {
            timestamp,
            black_count,
            white_count,
        }
    }

    #[test]
    fn test_scenario() {
        let c = config();
        let t = transition(None, 0, &c);
        assert_eq!((t.state, t.defer, t.update), (State::Unknown, true, Some(rec(0, 0, 0))));

        let t = transition(t.update, 10 * MIN, &c);
        assert_eq!((t.state, t.defer, t.update), (State::Black, true, Some(rec(0, 1, 0))));

        let t = transition(t.update, 60 * MIN, &c);
        assert_eq!(
            (t.state, t.defer, t.update),
            (State::Grey, false, Some(rec(60 * MIN, 1, 1)))
        );

        let t = transition(t.update, 90 * MIN, &c);
        assert_eq!(
            (t.state, t.defer, t.update),
            (State::White, false, Some(rec(90 * MIN, 1, 2)))
        );

        let later = 90 * MIN + c.white_timeout + MIN;
        let t = transition(t.update, later, &c);
        assert_eq!((t.state, t.defer, t.update), (State::Expired, false, None));
    }

    #[test]
    fn test_lapsed_white_with_recent_timestamp_is_black() {
        let c = GreylistConfig {
            white_timeout: 10 * MIN,
            ..config()
        };
        let t = transition(Some(rec(0, 0, 4)), 20 * MIN, &c);
        assert_eq!(t.state, State::Black);
        assert_eq!(t.update, Some(rec(0, 1, 4)));
        assert!(t.defer);
    }

    #[test]
    fn test_expired_black_record_is_not_reset() {
        let c = config();
        let stale = rec(0, 7, 0);
        let t = transition(Some(stale), 300 * MIN, &c);
        assert_eq!(t.state, State::Expired);
        assert_eq!(t.update, None);
        assert!(!t.defer);
    }

    #[test]
    fn test_counters_saturate() {
        let c = config();
        let t = transition(Some(rec(0, 0, u64::MAX)), MIN, &c);
        assert_eq!(t.state, State::White);
        assert_eq!(t.update, Some(rec(MIN, 0, u64::MAX)));

        let t = transition(Some(rec(0, u64::MAX, 0)), MIN, &c);
        assert_eq!(t.state, State::Black);
        assert_eq!(t.update, Some(rec(0, u64::MAX, 0)));
    }

    #[test]
    fn test_window_edges() {
        let c = config();
        assert_eq!(State::of(Some(&rec(0, 0, 0)), 50 * MIN - 1, &c), State::Black);
        assert_eq!(State::of(Some(&rec(0, 0, 0)), 50 * MIN, &c), State::Grey);
        assert_eq!(State::of(Some(&rec(0, 0, 0)), 200 * MIN, &c), State::Expired);
        assert_eq!(State::of(None, 0, &c), State::Unknown);
    }
}
