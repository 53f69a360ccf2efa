//! Time source for the greylisting windows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current time as seconds since the Unix epoch.
    fn now_unix_sec(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_sec(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Default)]
pub struct MockClock {
    timestamp: AtomicU64,
}

impl MockClock {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp: AtomicU64::new(timestamp),
        }
    }

    pub fn set(&self, timestamp: u64) {
        self.timestamp.store(timestamp, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.timestamp.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_unix_sec(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }
}

#[test]
fn test_mock_clock() {
    let clock = MockClock::new(1000);
    assert_eq!(clock.now_unix_sec(), 1000);
    clock.advance(60);
    assert_eq!(clock.now_unix_sec(), 1060);
    clock.set(5);
    assert_eq!(clock.now_unix_sec(), 5);
}

#[test]
fn test_system_clock_is_past_2020() {
    assert!(SystemClock.now_unix_sec() > 1_577_836_800);
}
