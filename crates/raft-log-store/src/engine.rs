//! # engine
//!
//! why: isolate the ordered key-value store the log is persisted in
//! relations: driven by store.rs, metadata.rs and consistency.rs through the KvEngine trait
//! what: KvEngine trait, WriteBatch, RedbEngine (durable), MemoryEngine (testing)

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

/// Single table holding metadata and entries.
/// Key: 2-byte metadata literal or 4-byte big-endian index, Value: encoded bytes
const LOG_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("raft_log");

/// errors raised by an engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// a `put_if_absent` found its key occupied; nothing in the batch was applied
    #[error("key {0:02x?} already present")]
    KeyExists(Vec<u8>),

    /// the backing store failed
    #[error("storage engine error: {0}")]
    Backend(String),
}

impl EngineError {
    fn from_redb<E: std::error::Error>(e: E) -> Self {
        EngineError::Backend(e.to_string())
    }
}

/// one operation inside a write batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    /// put that aborts the whole batch when the key already exists
    PutIfAbsent { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// an ordered set of writes that an engine applies all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn put_if_absent(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(BatchOp::PutIfAbsent {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// ordered byte-key/byte-value store the log is kept in
///
/// implementations must apply a [`WriteBatch`] atomically: after `write`
/// returns, either every operation is visible or none is.
pub trait KvEngine {
    /// point lookup
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// apply a batch in one transaction
    fn write(&self, batch: WriteBatch) -> Result<(), EngineError>;

    /// up to `limit` pairs with `start <= key <= end`, in ascending key order
    ///
    /// empty when `start > end`.
    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, EngineError>;
}

/// key and value as returned by [`KvEngine::scan`]
pub type KvPair = (Vec<u8>, Vec<u8>);

// -- redb engine --

/// tuning knobs for [`RedbEngine`]
#[derive(Debug, Clone, Default)]
pub struct RedbConfig {
    pub cache_size_bytes: Option<usize>,
}

/// durable engine on top of redb
///
/// every committed write transaction is flushed before `write` returns.
pub struct RedbEngine {
    db: Database,
}

impl RedbEngine {
    /// create the database file at `path`, or open it if it already exists
    pub fn create(path: impl AsRef<Path>, config: &RedbConfig) -> Result<Self, EngineError> {
        let mut builder = Database::builder();
        if let Some(bytes) = config.cache_size_bytes {
            builder.set_cache_size(bytes);
        }
        let db = builder.create(path).map_err(EngineError::from_redb)?;
        Self::with_table(db)
    }

    /// open an existing database file, failing if it is absent
    pub fn open(path: impl AsRef<Path>, config: &RedbConfig) -> Result<Self, EngineError> {
        let mut builder = Database::builder();
        if let Some(bytes) = config.cache_size_bytes {
            builder.set_cache_size(bytes);
        }
        let db = builder.open(path).map_err(EngineError::from_redb)?;
        Self::with_table(db)
    }

    // read transactions fail on a table that was never created
    fn with_table(db: Database) -> Result<Self, EngineError> {
        let write_txn = db.begin_write().map_err(EngineError::from_redb)?;
        {
            let _ = write_txn
                .open_table(LOG_TABLE)
                .map_err(EngineError::from_redb)?;
        }
        write_txn.commit().map_err(EngineError::from_redb)?;
        Ok(Self { db })
    }
}

impl KvEngine for RedbEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let read_txn = self.db.begin_read().map_err(EngineError::from_redb)?;
        let table = read_txn
            .open_table(LOG_TABLE)
            .map_err(EngineError::from_redb)?;
        let value = table.get(key).map_err(EngineError::from_redb)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), EngineError> {
        let write_txn = self.db.begin_write().map_err(EngineError::from_redb)?;
        let applied = {
            let mut table = write_txn
                .open_table(LOG_TABLE)
                .map_err(EngineError::from_redb)?;
            apply_ops(&mut table, batch.ops)
        };
        match applied {
            Ok(()) => write_txn.commit().map_err(EngineError::from_redb),
            Err(e) => {
                write_txn.abort().map_err(EngineError::from_redb)?;
                Err(e)
            }
        }
    }

    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, EngineError> {
        if start > end || limit == 0 {
            return Ok(Vec::new());
        }
        let read_txn = self.db.begin_read().map_err(EngineError::from_redb)?;
        let table = read_txn
            .open_table(LOG_TABLE)
            .map_err(EngineError::from_redb)?;

        let mut pairs = Vec::new();
        for result in table.range(start..=end).map_err(EngineError::from_redb)?.take(limit) {
            let (key, value) = result.map_err(EngineError::from_redb)?;
            pairs.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(pairs)
    }
}

fn apply_ops(
    table: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    ops: Vec<BatchOp>,
) -> Result<(), EngineError> {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(EngineError::from_redb)?;
            }
            BatchOp::PutIfAbsent { key, value } => {
                let occupied = table
                    .get(key.as_slice())
                    .map_err(EngineError::from_redb)?
                    .is_some();
                if occupied {
                    return Err(EngineError::KeyExists(key));
                }
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(EngineError::from_redb)?;
            }
            BatchOp::Delete { key } => {
                table
                    .remove(key.as_slice())
                    .map_err(EngineError::from_redb)?;
            }
        }
    }
    Ok(())
}

// -- in-memory engine --

/// in-memory engine for testing
///
/// keeps everything in a BTreeMap, no persistence across restarts
#[derive(Debug, Default)]
pub struct MemoryEngine {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of keys currently stored
    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let map = self
            .map
            .read()
            .map_err(|_| EngineError::Backend("memory engine lock poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), EngineError> {
        let mut map = self
            .map
            .write()
            .map_err(|_| EngineError::Backend("memory engine lock poisoned".to_string()))?;

        // validate first so a rejected batch leaves the map untouched
        for op in batch.ops() {
            if let BatchOp::PutIfAbsent { key, .. } = op {
                if map.contains_key(key) {
                    return Err(EngineError::KeyExists(key.clone()));
                }
            }
        }
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } | BatchOp::PutIfAbsent { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, EngineError> {
        if start > end {
            return Ok(Vec::new());
        }
        let map = self
            .map
            .read()
            .map_err(|_| EngineError::Backend("memory engine lock poisoned".to_string()))?;
        Ok(map
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(engine: &dyn KvEngine) {
        let mut batch = WriteBatch::new();
        batch.put(b"CT".to_vec(), vec![0, 0, 0, 1]).put(vec![0, 0, 0, 1], b"one".to_vec());
        engine.write(batch).unwrap();

        assert_eq!(engine.get(b"CT").unwrap(), Some(vec![0, 0, 0, 1]));
        assert_eq!(engine.get(&[0, 0, 0, 1]).unwrap(), Some(b"one".to_vec()));
        assert_eq!(engine.get(b"LA").unwrap(), None);

        // occupied key rejects the whole batch, including earlier ops
        let mut batch = WriteBatch::new();
        batch
            .put(b"CT".to_vec(), vec![0, 0, 0, 9])
            .put_if_absent(vec![0, 0, 0, 1], b"uno".to_vec());
        let err = engine.write(batch).unwrap_err();
        assert!(matches!(err, EngineError::KeyExists(ref k) if k == &vec![0, 0, 0, 1]));
        assert_eq!(engine.get(b"CT").unwrap(), Some(vec![0, 0, 0, 1]));
        assert_eq!(engine.get(&[0, 0, 0, 1]).unwrap(), Some(b"one".to_vec()));

        let mut batch = WriteBatch::new();
        batch.delete(b"CT".to_vec()).put_if_absent(vec![0, 0, 0, 2], b"two".to_vec());
        engine.write(batch).unwrap();
        assert_eq!(engine.get(b"CT").unwrap(), None);
        assert_eq!(engine.get(&[0, 0, 0, 2]).unwrap(), Some(b"two".to_vec()));
    }

    fn exercise_scan(engine: &dyn KvEngine) {
        let mut batch = WriteBatch::new();
        for index in [7u32, 1, 300, 70_000] {
            batch.put(index.to_be_bytes().to_vec(), vec![index as u8]);
        }
        batch.put(b"CT".to_vec(), vec![0, 0, 0, 1]);
        engine.write(batch).unwrap();

        let keys = |start: u32, end: u32, limit: usize| -> Vec<Vec<u8>> {
            engine
                .scan(&start.to_be_bytes(), &end.to_be_bytes(), limit)
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect()
        };

        assert_eq!(
            keys(0, 1_000, 10),
            vec![1u32.to_be_bytes().to_vec(), 7u32.to_be_bytes().to_vec(), 300u32.to_be_bytes().to_vec()]
        );
        assert_eq!(keys(0, u32::MAX, 2).len(), 2);
        assert!(keys(8, 299, 10).is_empty());
        assert!(keys(10, 5, 10).is_empty());

        // 2-byte keys sort between 4-byte ones and come back too
        let all = engine.scan(&[0, 0, 0, 0], &[0xFF; 4], 100).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().any(|(k, _)| k.as_slice() == b"CT"));
    }

    #[test]
    fn memory_engine_scans_in_key_order() {
        exercise_scan(&MemoryEngine::new());
    }

    #[test]
    fn redb_engine_scans_in_key_order() {
        let dir = tempdir().unwrap();
        let engine = RedbEngine::create(dir.path().join("log.redb"), &RedbConfig::default()).unwrap();
        exercise_scan(&engine);
    }

    #[test]
    fn memory_engine_applies_batches_atomically() {
        let engine = MemoryEngine::new();
        exercise(&engine);
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn redb_engine_applies_batches_atomically() {
        let dir = tempdir().unwrap();
        let engine = RedbEngine::create(dir.path().join("log.redb"), &RedbConfig::default()).unwrap();
        exercise(&engine);
    }

    #[test]
    fn redb_engine_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.redb");
        {
            let engine = RedbEngine::create(&path, &RedbConfig::default()).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(b"FA".to_vec(), vec![0, 0, 0, 3]);
            engine.write(batch).unwrap();
        }

        let engine = RedbEngine::open(&path, &RedbConfig::default()).unwrap();
        assert_eq!(engine.get(b"FA").unwrap(), Some(vec![0, 0, 0, 3]));
    }

    #[test]
    fn redb_open_fails_on_missing_file() {
        let dir = tempdir().unwrap();
        let result = RedbEngine::open(dir.path().join("absent.redb"), &RedbConfig::default());
        assert!(matches!(result, Err(EngineError::Backend(_))));
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let engine = MemoryEngine::new();
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        engine.write(batch).unwrap();
        assert!(engine.is_empty());
    }
}
