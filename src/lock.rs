//! Store locking.
//!
//! Every decision runs under one exclusive lock. [`LocalLock`] uses
//! `flock(2)` on a sidecar file and waits as long as needed. [`NfsLock`] is
//! for stores on network filesystems, where `flock` is unreliable and a
//! crashed holder may never release: the lock is an exclusively created file,
//! the wait is bounded, and a lock file older than the staleness bound is
//! reclaimed.

use crate::config::GreylistConfig;
use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

pub const NFS_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const NFS_STALE_AFTER: Duration = Duration::from_secs(30 * 60);
const NFS_POLL_INTERVAL: Duration = Duration::from_millis(50);

static NFS_LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

pub trait Locker: Send + Sync {
    /// Block until the lock protecting `db` is held. The lock is released
    /// when the guard is dropped.
    fn acquire(&self, db: &Path) -> Result<LockGuard>;
}

pub fn for_config(config: &GreylistConfig) -> Box<dyn Locker> {
    if config.nfslock {
        Box::new(NfsLock::default())
    } else {
        Box::new(LocalLock)
    }
}

fn sidecar(db: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = db.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard {
    held: Held,
}

enum Held {
    Local(#[allow(dead_code)] Flock<File>),
    Nfs { path: PathBuf, token: String },
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Held::Nfs { path, token } = &self.held else {
            return;
        };
        // the file may have been reclaimed and recreated by another holder
        match fs::read_to_string(path) {
            Ok(content) if content == *token => {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), "cannot remove lock file: {e}");
                }
            }
            Ok(_) => warn!(path = %path.display(), "lock file taken over, leaving it"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "lock file vanished while held")
            }
            Err(e) => warn!(path = %path.display(), "cannot read lock file: {e}"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLock;

impl Locker for LocalLock {
    fn acquire(&self, db: &Path) -> Result<LockGuard> {
        let path = sidecar(db, "lock");
        let failed = |source| Error::LockAcquisitionFailed {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(failed)?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(flock) => {
                    return Ok(LockGuard {
                        held: Held::Local(flock),
                    });
                }
                Err((f, Errno::EINTR)) => file = f,
                Err((_, errno)) => return Err(failed(errno.into())),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NfsLock {
    pub timeout: Duration,
    pub stale_after: Duration,
}

impl Default for NfsLock {
    fn default() -> Self {
        Self {
            timeout: NFS_LOCK_TIMEOUT,
            stale_after: NFS_STALE_AFTER,
        }
    }
}

fn older_than(path: &Path, bound: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age >= bound)
}

impl NfsLock {
    fn is_stale(&self, path: &Path) -> bool {
        older_than(path, self.stale_after)
    }

    /// Remove a stale lock file. Reclaimers serialize on `<lock>.reclaim`
    /// and recheck staleness while holding it, so a lock file created after
    /// an earlier staleness check is left in place.
    fn reclaim(&self, path: &Path) -> bool {
        let serial = sidecar(path, "reclaim");
        if older_than(&serial, self.timeout) {
            let _ = fs::remove_file(&serial);
        }
        if OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&serial)
            .is_err()
        {
            debug!(path = %path.display(), "another reclaim in progress");
            return false;
        }
        let reclaimed = self.remove_if_stale(path);
        if let Err(e) = fs::remove_file(&serial) {
            warn!(path = %serial.display(), "cannot remove reclaim marker: {e}");
        }
        reclaimed
    }

    fn remove_if_stale(&self, path: &Path) -> bool {
        let Ok(seen) = fs::read_to_string(path) else {
            return false;
        };
        if !self.is_stale(path) {
            debug!(path = %path.display(), "lock is no longer stale");
            return false;
        }
        let aside = sidecar(path, &format!("stale.{}", std::process::id()));
        if let Err(e) = fs::rename(path, &aside) {
            debug!(path = %path.display(), "stale lock already gone: {e}");
            return false;
        }
        let unchanged = fs::read_to_string(&aside).is_ok_and(|c| c == seen);
        if unchanged && self.is_stale(&aside) {
            warn!(path = %path.display(), owner = seen.trim(), "reclaimed stale lock");
            let _ = fs::remove_file(&aside);
            return true;
        }
        // moved a live lock, put it back unless a new one already exists
        if let Err(e) = fs::hard_link(&aside, path) {
            warn!(path = %path.display(), "cannot restore live lock: {e}");
        }
        let _ = fs::remove_file(&aside);
        false
    }
}

impl Locker for NfsLock {
    fn acquire(&self, db: &Path) -> Result<LockGuard> {
        let path = sidecar(db, "NFSLock");
        let started = Instant::now();
        let token = format!(
            "{} {} {}\n",
            std::process::id(),
            nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            NFS_LOCK_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let written = file.write_all(token.as_bytes()).and_then(|_| file.sync_all());
                    if let Err(source) = written {
                        let _ = fs::remove_file(&path);
                        return Err(Error::LockAcquisitionFailed { path, source });
                    }
                    return Ok(LockGuard {
                        held: Held::Nfs { path, token },
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale(&path) && self.reclaim(&path) {
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        return Err(Error::LockTimeout { path, waited });
                    }
                    thread::sleep(NFS_POLL_INTERVAL.min(self.timeout - waited));
                }
                Err(source) => return Err(Error::LockAcquisitionFailed { path, source }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backdate(path: &Path, secs: u64) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_nfs_lock_times_out_while_held() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("greylist.dbm");
        let locker = NfsLock {
            timeout: Duration::from_millis(200),
            stale_after: NFS_STALE_AFTER,
        };
        let _held = locker.acquire(&db).unwrap();
        match locker.acquire(&db) {
            Err(Error::LockTimeout { waited, .. }) => {
                assert!(waited >= Duration::from_millis(200))
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("lock acquired twice"),
        }
    }

    #[test]
    fn test_nfs_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("greylist.dbm");
        let locker = NfsLock::default();
        drop(locker.acquire(&db).unwrap());
        assert!(!dir.path().join("greylist.dbm.NFSLock").exists());
        drop(locker.acquire(&db).unwrap());
    }

    #[test]
    fn test_nfs_lock_reclaims_stale() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("greylist.dbm");
        let stale = dir.path().join("greylist.dbm.NFSLock");
        fs::write(&stale, "1 crashed-host\n").unwrap();
        backdate(&stale, 3600);
        let locker = NfsLock {
            timeout: Duration::from_millis(200),
            stale_after: Duration::from_secs(1800),
        };
        let _guard = locker.acquire(&db).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_late_reclaim_keeps_fresh_lock() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("greylist.dbm");
        let lock = dir.path().join("greylist.dbm.NFSLock");
        fs::write(&lock, "1 crashed-host\n").unwrap();
        backdate(&lock, 3600);
        let locker = NfsLock {
            timeout: Duration::from_millis(200),
            stale_after: Duration::from_secs(1800),
        };
        // a second contender saw the stale file before the first one reclaimed it
        assert!(locker.is_stale(&lock));
        let first = locker.acquire(&db).unwrap();
        assert!(!locker.reclaim(&lock));
        assert!(matches!(
            locker.acquire(&db),
            Err(Error::LockTimeout { .. })
        ));
        drop(first);
        assert!(!lock.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_guard_leaves_lock_file_of_other_holder() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("greylist.dbm");
        let lock = dir.path().join("greylist.dbm.NFSLock");
        let guard = NfsLock::default().acquire(&db).unwrap();
        fs::write(&lock, "2 other-host 0\n").unwrap();
        drop(guard);
        assert_eq!(fs::read_to_string(&lock).unwrap(), "2 other-host 0\n");
    }

    #[test]
    fn test_nfs_lock_tokens_differ() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("greylist.dbm");
        let lock = dir.path().join("greylist.dbm.NFSLock");
        let locker = NfsLock::default();
        let guard = locker.acquire(&db).unwrap();
        let first = fs::read_to_string(&lock).unwrap();
        drop(guard);
        let _guard = locker.acquire(&db).unwrap();
        let second = fs::read_to_string(&lock).unwrap();
        assert!(first.starts_with(&format!("{} ", std::process::id())));
        assert_ne!(first, second);
    }

    #[test]
    fn test_local_lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("greylist.dbm");
        let guard = LocalLock.acquire(&db).unwrap();
        let db2 = db.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = thread::spawn(move || {
            let _g = LocalLock.acquire(&db2).unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
