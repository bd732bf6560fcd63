//! Redb-based persistent key-value store.

use std::ops::Bound;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::{BatchOp, KVError, KVResult, KVStore, WriteBatch};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("faces");

fn storage_err(e: impl std::fmt::Display) -> KVError {
    KVError::Storage(e.to_string())
}

/// A persistent key-value store backed by redb.
///
/// Each trait call runs in its own redb transaction.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> KVResult<Self> {
        let db = Database::create(path).map_err(storage_err)?;

        // Create the table if it doesn't exist.
        let tx = db.begin_write().map_err(storage_err)?;
        {
            let _ = tx.open_table(TABLE).map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;

        Ok(Self { db })
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(TABLE).map_err(storage_err)?;

        Ok(table
            .get(key)
            .map_err(storage_err)?
            .map(|value| value.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> KVResult<()> {
        let tx = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage_err)?;
            table.insert(key, value).map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }

    fn delete(&self, key: &str) -> KVResult<()> {
        let tx = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage_err)?;
            table.remove(key).map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(TABLE).map_err(storage_err)?;

        let mut results = Vec::new();
        for item in table.range(prefix..).map_err(storage_err)? {
            let (key, value) = item.map_err(storage_err)?;
            let key_str = key.value();
            if !key_str.starts_with(prefix) {
                break;
            }
            results.push((key_str.to_string(), value.value().to_vec()));
        }
        Ok(results)
    }

    fn scan_after(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> KVResult<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(TABLE).map_err(storage_err)?;

        let lower = match after {
            Some(a) if a >= prefix => Bound::Excluded(a),
            _ => Bound::Included(prefix),
        };

        let mut results = Vec::new();
        for item in table
            .range::<&str>((lower, Bound::Unbounded))
            .map_err(storage_err)?
        {
            if results.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(storage_err)?;
            let key_str = key.value();
            if !key_str.starts_with(prefix) {
                break;
            }
            results.push((key_str.to_string(), value.value().to_vec()));
        }
        Ok(results)
    }

    fn write(&self, batch: WriteBatch) -> KVResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let tx = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage_err)?;
            for op in batch.ops() {
                match op {
                    BatchOp::Set { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(storage_err)?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_str()).map_err(storage_err)?;
                    }
                }
            }
        }
        // Dropping an uncommitted transaction aborts it, so a failed op
        // above leaves the table untouched.
        tx.commit().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_redb_basic() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.set("key1", b"value1").unwrap();
        assert_eq!(store.get("key1").unwrap(), Some(b"value1".to_vec()));

        store.delete("key1").unwrap();
        assert_eq!(store.get("key1").unwrap(), None);
    }

    #[test]
    fn test_redb_scan_stops_at_prefix_end() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.set("face:m:b", b"2").unwrap();
        store.set("face:m:a", b"1").unwrap();
        store.set("face:n:c", b"3").unwrap();
        store.set("face:l:c", b"0").unwrap();

        let results = store.scan("face:m:").unwrap();
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["face:m:a", "face:m:b"]);
    }

    #[test]
    fn test_redb_write_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set("gone", b"x").unwrap();

            let mut batch = WriteBatch::new();
            batch.set("a", b"1".to_vec()).set("b", b"2".to_vec()).delete("gone");
            store.write(batch).unwrap();
        }

        // Reopen to make sure the batch was committed.
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get("gone").unwrap(), None);
        assert_eq!(store.count("").unwrap(), 2);
    }

    #[test]
    fn test_redb_scan_after() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();
        for k in ["m:a", "m:b", "m:c", "z:a"] {
            store.set(k, b"").unwrap();
        }

        let page = store.scan_after("m:", Some("m:a"), 10).unwrap();
        let keys: Vec<&str> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["m:b", "m:c"]);

        let page = store.scan_after("m:", None, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, "m:a");
    }
}
