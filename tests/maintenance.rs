use greymilter::lock::LocalLock;
use greymilter::maintenance::{migrate_legacy_keys, prune};
use greymilter::store::{DB_FILENAME, LEGACY_DB_FILENAME};
use greymilter::{GreylistConfig, Greylister, MockClock, Store};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const NOW: u64 = 1_700_000_000;
const WHITE: u64 = 36 * 24 * 3600;

fn store_with(dir: &Path, name: &str, content: &str) -> Store {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    Store::open(path, Box::new(LocalLock)).unwrap()
}

fn snapshot(store: &Store) -> Vec<(String, String)> {
    store
        .lock()
        .unwrap()
        .iter()
        .map(|(k, r)| (k.to_string(), r.map(|r| r.to_string()).unwrap_or_default()))
        .collect()
}

#[test]
fn prune_removes_aged_records_once() {
    let dir = tempdir().unwrap();
    let content = format!(
        "fresh-black\t{}:1:3:0\nold-black\t{}:1:9:0\nold-white\t{}:1:1:4\nfresh-white\t{}:1:1:4\nbroken\tx\n",
        NOW - 60,
        NOW - WHITE,
        NOW - WHITE - 1,
        NOW - WHITE + 1,
    );
    let store = store_with(dir.path(), DB_FILENAME, &content);
    assert_eq!(prune(&store, WHITE, NOW).unwrap(), 3);
    let keys: Vec<_> = snapshot(&store).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, ["fresh-black", "fresh-white"]);
    assert_eq!(prune(&store, WHITE, NOW).unwrap(), 0);
}

#[test]
fn migration_is_idempotent() {
    let dir = tempdir().unwrap();
    let content = "10.0.0.1:a@b\t100:1:2:0\n\
                   167772162\t200:1:0:1\n\
                   10.0.0.3\t300:1:1:1\n\
                   167772163\t250:1:0:0\n\
                   10.0.0.4\t400:1:0:0\n\
                   167772164\t500:1:0:3\n";
    let store = store_with(dir.path(), DB_FILENAME, content);
    assert_eq!(migrate_legacy_keys(&store).unwrap(), 3);
    let once = snapshot(&store);
    assert_eq!(
        once,
        [
            ("167772161:a@b".to_string(), "100:1:2:0".to_string()),
            ("167772162".to_string(), "200:1:0:1".to_string()),
            ("167772163".to_string(), "300:1:1:1".to_string()),
            ("167772164".to_string(), "500:1:0:3".to_string()),
        ]
    );
    assert_eq!(migrate_legacy_keys(&store).unwrap(), 0);
    assert_eq!(snapshot(&store), once);
}

#[test]
fn maintain_uses_legacy_file_and_prunes() {
    let dir = tempdir().unwrap();
    let content = format!("10.0.0.1\t{}:1:0:0\n10.0.0.2\t{}:1:0:0\n", NOW - 10, NOW - WHITE);
    store_with(dir.path(), LEGACY_DB_FILENAME, &content);
    let greylister = Greylister::new(GreylistConfig::default())
        .with_clock(Arc::new(MockClock::new(NOW)))
        .with_search_dirs(vec![dir.path().to_path_buf()]);
    assert_eq!(greylister.maintain().unwrap(), (2, 1));
    assert!(!dir.path().join(DB_FILENAME).exists());
    let legacy = Store::open(dir.path().join(LEGACY_DB_FILENAME), Box::new(LocalLock)).unwrap();
    assert_eq!(
        snapshot(&legacy),
        [("167772161".to_string(), format!("{}:1:0:0", NOW - 10))]
    );
}
