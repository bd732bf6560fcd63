//! Record storage for face markers, clusters and subjects.
//!
//! A small trait-based key-value interface with string keys and byte values.
//! Every call is its own transaction; [`KVStore::write`] applies a
//! [`WriteBatch`] of sets and deletes atomically, which is what callers use
//! for multi-record changes such as subject merges.

pub mod batch;
pub mod memory;
pub mod redb;

use std::fmt;
use thiserror::Error;

pub use batch::{BatchOp, WriteBatch};

/// Errors that can occur in KV store operations.
#[derive(Error, Debug)]
pub enum KVError {
    #[error("kv: not found")]
    NotFound,

    #[error("kv: storage error: {0}")]
    Storage(String),

    #[error("kv: serialization error: {0}")]
    Serialization(String),
}

/// Result type for KV operations.
pub type KVResult<T> = Result<T, KVError>;

/// Key-value store trait.
///
/// Implementations must be safe for concurrent use. Single-key calls are
/// atomic; [`KVStore::write`] is atomic across all keys in the batch.
pub trait KVStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>>;

    /// Set a key-value pair.
    fn set(&self, key: &str, value: &[u8]) -> KVResult<()>;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> KVResult<()>;

    /// Scan for keys with a given prefix, sorted by key.
    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>>;

    /// Apply all operations of the batch in one transaction.
    /// Either every operation is visible afterwards or none is.
    fn write(&self, batch: WriteBatch) -> KVResult<()>;

    /// Batch set multiple key-value pairs.
    fn batch_set(&self, entries: &[(&str, &[u8])]) -> KVResult<()> {
        let mut batch = WriteBatch::new();
        for (key, value) in entries {
            batch.set(key, value.to_vec());
        }
        self.write(batch)
    }

    /// Batch delete multiple keys.
    fn batch_delete(&self, keys: &[&str]) -> KVResult<()> {
        let mut batch = WriteBatch::new();
        for key in keys {
            batch.delete(key);
        }
        self.write(batch)
    }

    /// Scan up to `limit` entries with a given prefix whose key sorts
    /// strictly after `after`, in key order. Used for cursor paging.
    fn scan_after(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> KVResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .scan(prefix)?
            .into_iter()
            .filter(|(k, _)| after.is_none_or(|a| k.as_str() > a))
            .take(limit)
            .collect())
    }

    /// Count keys with a given prefix.
    fn count(&self, prefix: &str) -> KVResult<usize> {
        Ok(self.scan(prefix)?.len())
    }
}

impl fmt::Debug for dyn KVStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KVStore {{ ... }}")
    }
}

/// A boxed KV store for use in trait objects.
pub type BoxedKVStore = Box<dyn KVStore>;

pub use memory::MemoryStore;
pub use redb::RedbStore;
