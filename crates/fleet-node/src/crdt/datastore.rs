//! Key/value backends for the replicated store.
//!
//! Keys are `/`-separated paths. [`RedbDatastore`] supports atomic batches;
//! [`MemoryDatastore`] writes through.

use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

const DATA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("crdt");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("invalid delta: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("tombstone retention must be positive")]
    InvalidRetention,
    #[error("operation cancelled")]
    Cancelled,
}

/// A set of writes committed atomically.
pub trait Batch: Send {
    fn put(&mut self, key: &str, value: &[u8]);
    fn delete(&mut self, key: &str);
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Storage used by the replicated store. Implementations are thread-safe.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`; [`StoreError::NotFound`] if it is absent.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn query(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// A batch, when the backend supports atomic multi-writes.
    fn batch(&self) -> Option<Box<dyn Batch + '_>> {
        None
    }
}

/// In-memory backend without batching.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).map(|_| ()).ok_or(StoreError::NotFound)
    }

    fn query(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// On-disk backend.
pub struct RedbDatastore {
    db: Database,
}

impl RedbDatastore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DATA_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    fn apply(&self, ops: &[BatchOp]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DATA_TABLE)?;
            for op in ops {
                match op {
                    BatchOp::Put(key, value) => {
                        table.insert(key.as_bytes(), value.as_slice())?;
                    }
                    BatchOp::Delete(key) => {
                        table.remove(key.as_bytes())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl Datastore for RedbDatastore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        Ok(table.get(key.as_bytes())?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.apply(&[BatchOp::Put(key.to_string(), value.to_vec())])
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(DATA_TABLE)?;
            let removed = table.remove(key.as_bytes())?;
            removed.is_some()
        };
        write_txn.commit()?;
        if existed { Ok(()) } else { Err(StoreError::NotFound) }
    }

    fn query(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let mut result = Vec::new();
        for entry in table.range(prefix.as_bytes()..)? {
            let (k, v) = entry?;
            let key = k.value();
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec()).map_err(|e| StoreError::Corrupt {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            })?;
            result.push((key, v.value().to_vec()));
        }
        Ok(result)
    }

    fn batch(&self) -> Option<Box<dyn Batch + '_>> {
        Some(Box::new(RedbBatch {
            store: self,
            ops: Vec::new(),
        }))
    }
}

enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

struct RedbBatch<'a> {
    store: &'a RedbDatastore,
    ops: Vec<BatchOp>,
}

impl Batch for RedbBatch<'_> {
    fn put(&mut self, key: &str, value: &[u8]) {
        self.ops.push(BatchOp::Put(key.to_string(), value.to_vec()));
    }

    fn delete(&mut self, key: &str) {
        self.ops.push(BatchOp::Delete(key.to_string()));
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.store.apply(&self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Datastore) {
        store.put("/a/1", b"one").unwrap();
        store.put("/a/2", b"two").unwrap();
        store.put("/b/1", b"other").unwrap();

        assert_eq!(store.get("/a/1").unwrap().as_deref(), Some(&b"one"[..]));
        assert!(store.get("/missing").unwrap().is_none());

        let keys: Vec<String> = store.query("/a/").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);

        store.delete("/a/1").unwrap();
        assert!(matches!(store.delete("/a/1"), Err(StoreError::NotFound)));
        assert_eq!(store.query("/a/").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_datastore() {
        let store = MemoryDatastore::new();
        exercise(&store);
        assert!(store.batch().is_none());
    }

    #[test]
    fn test_redb_datastore() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbDatastore::open(dir.path().join("nested").join("registry.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_batch_is_deferred_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbDatastore::open(dir.path().join("registry.redb")).unwrap();
        store.put("/k/1", b"v").unwrap();

        let mut batch = store.batch().unwrap();
        batch.delete("/k/1");
        batch.delete("/k/absent");
        batch.put("/k/2", b"w");
        assert!(store.get("/k/1").unwrap().is_some());

        batch.commit().unwrap();
        assert!(store.get("/k/1").unwrap().is_none());
        assert_eq!(store.get("/k/2").unwrap().as_deref(), Some(&b"w"[..]));
    }
}
