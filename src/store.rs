use crate::error::{Error, Result};
use crate::lock::{LockGuard, Locker};
use crate::record::Record;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DB_FILENAME: &str = "greylist.dbm";
pub const LEGACY_DB_FILENAME: &str = "denysoft_greylist.dbm";
pub const SYSTEM_DB_DIR: &str = "/var/lib/greymilter";

pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(SYSTEM_DB_DIR)];
    if let Ok(exe) = std::env::current_exe()
        && let Some(prefix) = exe.parent().and_then(Path::parent)
    {
        dirs.push(prefix.join("var/db"));
        dirs.push(prefix.join("config"));
    }
    dirs.push(PathBuf::from("."));
    dirs
}

/// The first existing directory wins. Inside it the legacy filename is used
/// only when it exists and the current one does not.
pub fn resolve_path(candidates: &[PathBuf]) -> Result<PathBuf> {
    let dir = candidates
        .iter()
        .find(|d| d.is_dir())
        .ok_or(Error::NoStoreDirectory)?;
    let current = dir.join(DB_FILENAME);
    let legacy = dir.join(LEGACY_DB_FILENAME);
    if !current.exists() && legacy.exists() {
        return Ok(legacy);
    }
    Ok(current)
}

pub struct Store {
    path: PathBuf,
    locker: Box<dyn Locker>,
}

impl Store {
    /// The database file itself may be missing, its directory must exist.
    pub fn open(path: impl Into<PathBuf>, locker: Box<dyn Locker>) -> Result<Self> {
        let path = path.into();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        match fs::metadata(dir) {
            Ok(m) if m.is_dir() => Ok(Self { path, locker }),
            Ok(_) => Err(Error::StoreOpenFailed {
                path,
                source: std::io::Error::other("parent is not a directory"),
            }),
            Err(source) => Err(Error::StoreOpenFailed { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> Result<LockedStore<'_>> {
        let guard = self.locker.acquire(&self.path)?;
        let entries = self.read_entries()?;
        Ok(LockedStore {
            store: self,
            entries,
            dirty: false,
            _guard: guard,
        })
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(Error::StoreOpenFailed {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let mut entries = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            match line.split_once('\t') {
                Some((key, value)) => {
                    entries.insert(key.to_string(), value.to_string());
                }
                None if line.is_empty() => (),
                None => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    "dropping unreadable line"
                ),
            }
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        for (key, value) in entries {
            writeln!(writer, "{key}\t{value}")?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), records = entries.len(), "store written");
        Ok(())
    }
}

/// A store held under its lock. Changes are written by [`LockedStore::commit`];
/// dropping without commit discards them and releases the lock.
pub struct LockedStore<'a> {
    store: &'a Store,
    entries: BTreeMap<String, String>,
    dirty: bool,
    _guard: LockGuard,
}

impl LockedStore<'_> {
    /// A value that does not decode is reported and treated as absent.
    pub fn get(&self, key: &str) -> Option<Record> {
        let raw = self.entries.get(key)?;
        match raw.parse() {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, "{e}, treating as unknown");
                None
            }
        }
    }

    pub fn put(&mut self, key: &str, record: Record) {
        self.entries.insert(key.to_string(), record.to_string());
        self.dirty = true;
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.dirty |= removed;
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<Record>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.parse().ok()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn commit(self) -> Result<()> {
        if self.dirty {
            self.store.write_entries(&self.entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalLock;
    use tempfile::tempdir;

    #[test]
    fn test_put_commit_reload() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join(DB_FILENAME), Box::new(LocalLock)).unwrap();
        let mut locked = store.lock().unwrap();
        assert!(locked.is_empty());
        locked.put("1:a", Record::new(42));
        locked.commit().unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, "1:a\t42:1:0:0\n");
        let locked = store.lock().unwrap();
        assert_eq!(locked.get("1:a"), Some(Record::new(42)));
        assert_eq!(locked.get("1:b"), None);
    }

    #[test]
    fn test_uncommitted_changes_are_discarded() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join(DB_FILENAME), Box::new(LocalLock)).unwrap();
        let mut locked = store.lock().unwrap();
        locked.put("k", Record::new(1));
        drop(locked);
        assert!(store.lock().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_values_and_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DB_FILENAME);
        fs::write(&path, "good\t5:1:2:3\nbad\tnonsense\nno tab here\n").unwrap();
        let store = Store::open(&path, Box::new(LocalLock)).unwrap();
        let locked = store.lock().unwrap();
        assert_eq!(locked.len(), 2);
        assert_eq!(locked.get("bad"), None);
        assert_eq!(
            locked.get("good"),
            Some(Record {
                timestamp: 5,
                black_count: 2,
                white_count: 3
            })
        );
    }

    #[test]
    fn test_open_requires_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope").join(DB_FILENAME);
        assert!(matches!(
            Store::open(missing, Box::new(LocalLock)),
            Err(Error::StoreOpenFailed { .. })
        ));
    }

    #[test]
    fn test_resolve_path() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let missing = first.path().join("missing");
        let candidates = [missing, second.path().to_path_buf(), first.path().to_path_buf()];
        assert_eq!(
            resolve_path(&candidates).unwrap(),
            second.path().join(DB_FILENAME)
        );

        fs::write(second.path().join(LEGACY_DB_FILENAME), "").unwrap();
        assert_eq!(
            resolve_path(&candidates).unwrap(),
            second.path().join(LEGACY_DB_FILENAME)
        );

        fs::write(second.path().join(DB_FILENAME), "").unwrap();
        assert_eq!(
            resolve_path(&candidates).unwrap(),
            second.path().join(DB_FILENAME)
        );

        assert!(matches!(
            resolve_path(&[first.path().join("x")]),
            Err(Error::NoStoreDirectory)
        ));
    }
}
