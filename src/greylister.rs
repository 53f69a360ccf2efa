use crate::clock::{Clock, SystemClock};
use crate::config::{GreylistConfig, Overrides, merge, report_invalid};
use crate::engine::{self, Decision};
use crate::error::Result;
use crate::immunity::{ConnectionSignals, is_immune};
use crate::key::build_key;
use crate::lock;
use crate::maintenance;
use crate::store::{self, Store};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name of the per-recipient options file inside a recipient's directory.
pub const RECIPIENT_CONFIG_FILE: &str = "greylisting";

/// One greylisting question: may this triplet deliver now?
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub remote_ip: IpAddr,
    pub sender: &'a str,
    /// `None` for checks at MAIL FROM.
    pub recipient: Option<&'a str>,
    pub signals: &'a ConnectionSignals,
}

/// Entry point for decisions and maintenance. Holds no record state; every
/// call opens the store, locks it, and releases it before returning.
#[derive(Clone)]
pub struct Greylister {
    base: GreylistConfig,
    clock: Arc<dyn Clock>,
    search_dirs: Vec<PathBuf>,
    recipient_config_dir: Option<PathBuf>,
}

impl Greylister {
    pub fn new(base: GreylistConfig) -> Self {
        Self {
            base,
            clock: Arc::new(SystemClock),
            search_dirs: store::default_search_dirs(),
            recipient_config_dir: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Directories tried after the per-recipient and configured `db_dir`.
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    /// Root of the `<dir>/<recipient>/` trees used by `per_recipient` and
    /// `per_recipient_db`.
    pub fn with_recipient_config_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.recipient_config_dir = dir;
        self
    }

    pub fn base_config(&self) -> &GreylistConfig {
        &self.base
    }

    fn recipient_dir(&self, recipient: &str) -> Option<PathBuf> {
        let root = self.recipient_config_dir.as_ref()?;
        let name = recipient.trim_matches(['<', '>']).to_lowercase();
        if name.is_empty() || name.starts_with('.') || name.contains('/') {
            warn!(recipient, "recipient not usable as a directory name");
            return None;
        }
        Some(root.join(name))
    }

    /// Options overlaid for `recipient`, empty unless `per_recipient` is on
    /// and the recipient has an options file.
    pub fn recipient_overrides(&self, recipient: Option<&str>) -> Overrides {
        if !self.base.per_recipient {
            return Overrides::default();
        }
        let Some(dir) = recipient.and_then(|r| self.recipient_dir(r)) else {
            return Overrides::default();
        };
        let file = dir.join(RECIPIENT_CONFIG_FILE);
        match Overrides::load(&file) {
            Ok((overrides, invalid)) => {
                report_invalid(&file.display().to_string(), &invalid);
                overrides
            }
            Err(e) => {
                debug!(path = %file.display(), "no recipient options: {e}");
                Overrides::default()
            }
        }
    }

    /// Effective configuration for a decision about `recipient`.
    pub fn effective_config(&self, recipient: Option<&str>) -> GreylistConfig {
        merge(&self.base, &self.recipient_overrides(recipient))
    }

    pub fn store_path(&self, config: &GreylistConfig, recipient: Option<&str>) -> Result<PathBuf> {
        let mut candidates = Vec::with_capacity(self.search_dirs.len() + 2);
        if config.per_recipient_db
            && let Some(dir) = recipient.and_then(|r| self.recipient_dir(r))
        {
            candidates.push(dir);
        }
        if let Some(dir) = &config.db_dir {
            candidates.push(dir.clone());
        }
        candidates.extend(self.search_dirs.iter().cloned());
        store::resolve_path(&candidates)
    }

    pub fn open_store(&self, config: &GreylistConfig, recipient: Option<&str>) -> Result<Store> {
        let path = self.store_path(config, recipient)?;
        debug!(path = %path.display(), "using greylisting database");
        Store::open(path, lock::for_config(config))
    }

    /// Decide with the configuration already merged for this request.
    pub fn try_check_with(&self, request: &Request, config: &GreylistConfig) -> Result<Decision> {
        if is_immune(request.signals, config) {
            return Ok(Decision::Accept);
        }
        let key = build_key(request.remote_ip, request.sender, request.recipient, config)?;
        let store = self.open_store(config, request.recipient)?;
        let mut locked = store.lock()?;
        let decision = engine::decide(&mut locked, &key, self.clock.now_unix_sec(), config);
        locked.commit()?;
        Ok(decision)
    }

    pub fn try_check(&self, request: &Request) -> Result<Decision> {
        let config = self.effective_config(request.recipient);
        self.try_check_with(request, &config)
    }

    /// Fail-open decision: any error is logged and the mail accepted.
    pub fn check(&self, request: &Request) -> Decision {
        let config = self.effective_config(request.recipient);
        self.check_with(request, &config)
    }

    pub fn check_with(&self, request: &Request, config: &GreylistConfig) -> Decision {
        match self.try_check_with(request, config) {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    remote_ip = %request.remote_ip,
                    sender = request.sender,
                    recipient = request.recipient,
                    "greylisting failed, accepting: {e}"
                );
                Decision::Accept
            }
        }
    }

    /// Migrate legacy keys, then prune, on the base store. Meant to run once
    /// at startup.
    pub fn maintain(&self) -> Result<(usize, usize)> {
        let store = self.open_store(&self.base, None)?;
        let migrated = maintenance::migrate_legacy_keys(&store)?;
        let pruned = maintenance::prune(&store, self.base.white_timeout, self.clock.now_unix_sec())?;
        info!(path = %store.path().display(), migrated, pruned, "greylist maintenance done");
        Ok((migrated, pruned))
    }

    pub fn now(&self) -> u64 {
        self.clock.now_unix_sec()
    }
}

impl std::fmt::Debug for Greylister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Greylister")
            .field("base", &self.base)
            .field("search_dirs", &self.search_dirs)
            .field("recipient_config_dir", &self.recipient_config_dir)
            .finish_non_exhaustive()
    }
}
