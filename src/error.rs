use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reaching a greylisting decision.
///
/// The decision path is fail-open: [`crate::Greylister::check`] logs any of
/// these and accepts the mail.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no greylisting key components enabled (remote_ip, sender, recipient)")]
    NoKeyComponentsConfigured,

    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("cannot lock {}: {source}", path.display())]
    LockAcquisitionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open greylist store {}: {source}", path.display())]
    StoreOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("none of the greylist database directories exist")]
    NoStoreDirectory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
