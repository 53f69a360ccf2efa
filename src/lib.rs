pub mod allowlist;
pub mod cli;
pub mod clock;
pub mod config;
mod daemon;
pub mod engine;
mod error;
pub mod greylister;
pub mod immunity;
pub mod key;
pub mod lock;
pub mod maintenance;
mod milter;
pub mod record;
pub mod session;
pub mod store;
mod wire;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{GreylistConfig, Overrides, merge};
pub use daemon::{Config, process_client};
pub use engine::{Decision, State};
pub use error::{Error, Result};
pub use greylister::{Greylister, Request};
pub use immunity::ConnectionSignals;
pub use record::Record;
pub use session::{Envelope, StageVerdict};
pub use store::Store;

use std::fs;
use std::path::Path;

/// Read a list file: one entry per line, surrounding whitespace removed,
/// `#` starts a comment, empty lines are skipped.
pub fn read_array<P: AsRef<Path>>(filename: P) -> std::io::Result<Vec<String>> {
    let content = fs::read_to_string(filename)?;
    Ok(content
        .lines()
        .map(|line| match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn array_contains<S: AsRef<str>>(array: &[S], value: &str) -> bool {
    array.iter().any(|entry| entry.as_ref() == value)
}
