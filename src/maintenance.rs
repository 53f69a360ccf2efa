//! Store housekeeping: pruning of aged records and conversion of keys written
//! by older versions. Both run under the same lock as a decision.

use crate::error::Result;
use crate::key::current_form;
use crate::store::Store;
use tracing::{info, warn};

/// Delete every record whose timestamp is at least `white_timeout` old,
/// whatever state it is in. Undecodable records are deleted as well.
pub fn prune(store: &Store, white_timeout: u64, now: u64) -> Result<usize> {
    let mut locked = store.lock()?;
    let doomed: Vec<String> = locked
        .iter()
        .filter(|(_, record)| record.is_none_or(|r| r.age(now) >= white_timeout))
        .map(|(key, _)| key.to_string())
        .collect();
    for key in &doomed {
        locked.delete(key);
    }
    let remaining = locked.len();
    locked.commit()?;
    info!(pruned = doomed.len(), remaining, "pruned greylist database");
    Ok(doomed.len())
}

/// Rewrite keys whose address is still in dotted-quad form. Keys already in
/// integer form are left alone, so running this again changes nothing. When
/// both forms of a key exist the record with the newer timestamp is kept.
pub fn migrate_legacy_keys(store: &Store) -> Result<usize> {
    let mut locked = store.lock()?;
    let mut migrated = 0;
    for old_key in locked.keys() {
        let Some(new_key) = current_form(&old_key) else {
            continue;
        };
        let Some(record) = locked.get(&old_key) else {
            warn!(key = %old_key, "dropping undecodable legacy record");
            locked.delete(&old_key);
            continue;
        };
        match locked.get(&new_key) {
            Some(existing) if existing.timestamp >= record.timestamp => (),
            _ => locked.put(&new_key, record),
        }
        locked.delete(&old_key);
        migrated += 1;
    }
    locked.commit()?;
    if migrated > 0 {
        info!(migrated, "converted legacy greylist keys");
    }
    Ok(migrated)
}
