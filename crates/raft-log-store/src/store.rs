//! # store
//!
//! why: the durable log the consensus module appends to and reads back from
//! relations: wires codec.rs, metadata.rs, consistency.rs and engine.rs together
//! what: LogStore (open/close/delete, append, conflict-detecting append, get, iteration)
//!
//! Single writer: callers serialize mutating calls. Every index is written in
//! its own engine transaction together with the metadata it changes, and the
//! in-memory mirror only moves once that transaction has committed.

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use raft_core::{AppendResult, LogEntry, NodeId};

use crate::codec;
use crate::config::LogOptions;
use crate::consistency;
use crate::engine::{KvEngine, KvPair, RedbEngine, WriteBatch};
use crate::error::{LogError, Result};
use crate::metadata::{Metadata, MetadataRegistry};

/// durable replicated-log storage over an ordered key-value engine
pub struct LogStore<E: KvEngine = RedbEngine> {
    /// `None` once closed or deleted
    engine: Option<E>,
    registry: MetadataRegistry,
    /// directory owned by this store, `None` for caller-supplied engines
    location: Option<PathBuf>,
}

impl LogStore<RedbEngine> {
    /// open the log at `location`, creating and initializing it if absent
    ///
    /// an existing log has its metadata loaded and verified; a mismatch is
    /// returned as `Corruption` and no store is handed out.
    pub fn open(location: impl AsRef<Path>, options: &LogOptions) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        let db_path = location.join(&options.file_name);
        let config = options.engine_config();

        let engine = if db_path.exists() {
            RedbEngine::open(&db_path, &config)?
        } else if options.create_if_missing {
            fs::create_dir_all(&location)?;
            RedbEngine::create(&db_path, &config)?
        } else {
            return Err(LogError::IoFailure(format!(
                "no log at {} and create_if_missing is off",
                location.display()
            )));
        };

        let mut store = Self::with_engine(engine, options)?;
        tracing::info!(
            location = %location.display(),
            first_applied = ?store.first_applied(),
            last_applied = store.last_applied(),
            current_term = store.current_term(),
            "opened raft log"
        );
        store.location = Some(location);
        Ok(store)
    }
}

impl<E: KvEngine> LogStore<E> {
    /// open a log kept in `engine`
    ///
    /// `delete` on such a store only releases the engine.
    pub fn with_engine(engine: E, options: &LogOptions) -> Result<Self> {
        let registry = if MetadataRegistry::is_fresh(&engine)? {
            tracing::info!("log is new, initializing metadata");
            MetadataRegistry::initialize(&engine)?
        } else {
            let registry = MetadataRegistry::load(&engine)?;
            consistency::verify(registry.get(), &engine, options.verify_last_entry)?;
            registry
        };

        Ok(Self {
            engine: Some(engine),
            registry,
            location: None,
        })
    }

    /// release the engine; data stays on disk. Safe to call more than once.
    pub fn close(&mut self) {
        if self.engine.take().is_some() {
            tracing::info!(location = ?self.location, "closed raft log");
        }
    }

    /// close, then remove the location and everything in it
    pub fn delete(&mut self) -> Result<()> {
        self.close();
        if let Some(location) = self.location.take() {
            if location.exists() {
                fs::remove_dir_all(&location)?;
            }
            tracing::info!(location = %location.display(), "deleted raft log");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn engine(&self) -> Result<&E> {
        self.engine.as_ref().ok_or(LogError::NotInitialized)
    }

    // -- entries --

    /// entry stored at `index`, if any
    pub fn get(&self, index: u32) -> Result<Option<LogEntry>> {
        let engine = self.engine()?;
        engine
            .get(&codec::entry_key(index))?
            .map(|bytes| codec::decode_entry(&bytes))
            .transpose()
    }

    /// write `entries` at consecutive indices starting at `start_index`
    ///
    /// Each index commits on its own, together with `first_applied` (on the
    /// first ever append), `last_applied` and `current_term`. Without
    /// `overwrite`, an occupied index stops the call with `Conflict`; the
    /// entries before it stay committed.
    pub fn append(&mut self, start_index: u32, overwrite: bool, entries: &[LogEntry]) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(LogError::NotInitialized)?;
        let mut index = start_index;

        for entry in entries {
            if !codec::is_storable_index(index) {
                return Err(LogError::IndexOutOfRange { index });
            }

            let key = codec::entry_key(index);
            let value = codec::encode_entry(entry)?;
            let mut batch = WriteBatch::new();
            if overwrite {
                batch.put(key, value);
            } else {
                batch.put_if_absent(key, value);
            }

            let current = *self.registry.get();
            let next = Metadata {
                first_applied: current.first_applied.or(Some(index)),
                last_applied: index,
                current_term: entry.term,
                ..current
            };

            match self.registry.commit(engine, next, batch) {
                Ok(()) => {
                    tracing::debug!(index, term = entry.term, overwrite, "appended entry");
                }
                Err(LogError::Conflict { index }) => {
                    tracing::warn!(index, "entry already present, append stopped");
                    return Err(LogError::Conflict { index });
                }
                Err(e) => return Err(e),
            }

            // a committed index is below the reserved sentinel, so this cannot overflow
            index += 1;
        }

        Ok(())
    }

    /// append guarded by the log-matching check
    ///
    /// When no entry with `prev_term` sits at `prev_index` nothing is written
    /// and `prev_index` comes back as the back-off hint. Otherwise `entries`
    /// overwrite from `prev_index + 1` on.
    pub fn append_with_conflict_detection(
        &mut self,
        prev_index: u32,
        prev_term: u32,
        entries: &[LogEntry],
    ) -> Result<AppendResult> {
        match self.get(prev_index)? {
            Some(prev) if prev.term == prev_term => {}
            other => {
                tracing::warn!(
                    prev_index,
                    prev_term,
                    found_term = ?other.map(|e| e.term),
                    "previous entry does not match, rejecting append"
                );
                return Ok(AppendResult::rejected(prev_index));
            }
        }

        let start = prev_index
            .checked_add(1)
            .ok_or(LogError::IndexOutOfRange { index: prev_index })?;
        self.append(start, true, entries)?;
        Ok(AppendResult::accepted(self.last_applied()))
    }

    /// lazy iterator over `[start, end]` clamped to `[first_applied, last_applied]`
    pub fn entries(&self, start: u32, end: u32) -> Result<Entries<'_, E>> {
        let engine = self.engine()?;
        Ok(Entries::new(engine, self.clamp(start, end)))
    }

    /// lazy iterator over every retained entry
    pub fn iter(&self) -> Result<Entries<'_, E>> {
        self.entries(0, u32::MAX)
    }

    /// visit `[start, end]` (clamped) in ascending index order
    pub fn for_each_in<F>(&self, start: u32, end: u32, mut visitor: F) -> Result<()>
    where
        F: FnMut(u32, LogEntry) -> Result<()>,
    {
        for item in self.entries(start, end)? {
            let (index, entry) = item?;
            visitor(index, entry)?;
        }
        Ok(())
    }

    /// visit every retained entry; nothing happens on an empty log
    pub fn for_each<F>(&self, visitor: F) -> Result<()>
    where
        F: FnMut(u32, LogEntry) -> Result<()>,
    {
        self.for_each_in(0, u32::MAX, visitor)
    }

    fn clamp(&self, start: u32, end: u32) -> RangeInclusive<u32> {
        let meta = self.registry.get();
        match meta.first_applied {
            Some(first) => start.max(first)..=end.min(meta.last_applied),
            // empty
            None => RangeInclusive::new(1, 0),
        }
    }

    // -- metadata --

    pub fn current_term(&self) -> u32 {
        self.registry.get().current_term
    }

    /// persist a new term; monotonicity is the caller's job
    pub fn set_current_term(&mut self, term: u32) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(LogError::NotInitialized)?;
        self.registry.set_current_term(engine, term)?;
        tracing::debug!(term, "current term updated");
        Ok(())
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.registry.get().voted_for
    }

    pub fn set_voted_for(&mut self, voted_for: Option<NodeId>) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(LogError::NotInitialized)?;
        self.registry.set_voted_for(engine, voted_for)?;
        tracing::debug!(voted_for = ?voted_for, "vote updated");
        Ok(())
    }

    pub fn commit_index(&self) -> u32 {
        self.registry.get().commit_index
    }

    /// persist a new commit index; keeping it at or below last_applied is the caller's job
    pub fn set_commit_index(&mut self, index: u32) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(LogError::NotInitialized)?;
        self.registry.set_commit_index(engine, index)?;
        tracing::debug!(index, "commit index updated");
        Ok(())
    }

    /// oldest retained index, `None` while the log is empty
    pub fn first_applied(&self) -> Option<u32> {
        self.registry.get().first_applied
    }

    pub fn last_applied(&self) -> u32 {
        self.registry.get().last_applied
    }

    /// snapshot of the in-memory scalars
    pub fn metadata(&self) -> Metadata {
        *self.registry.get()
    }

    /// the scalars as currently stored by the engine
    pub fn durable_metadata(&self) -> Result<Metadata> {
        Metadata::read(self.engine()?)
    }
}

/// keys fetched per engine scan while iterating
const SCAN_BATCH: usize = 64;

/// entries of a clamped index range, fetched in ordered batches
///
/// gaps between stored indices are skipped without per-index lookups.
/// Cloning restarts from the clone's current position.
pub struct Entries<'a, E: KvEngine> {
    engine: &'a E,
    /// first key of the next scan, `None` once the range is exhausted
    cursor: Option<Vec<u8>>,
    end: Vec<u8>,
    buffered: std::vec::IntoIter<KvPair>,
}

impl<'a, E: KvEngine> Entries<'a, E> {
    fn new(engine: &'a E, range: RangeInclusive<u32>) -> Self {
        let cursor = (!range.is_empty()).then(|| codec::entry_key(*range.start()).to_vec());
        Self {
            engine,
            cursor,
            end: codec::entry_key(*range.end()).to_vec(),
            buffered: Vec::new().into_iter(),
        }
    }

    fn refill(&mut self) -> Result<bool> {
        let Some(start) = self.cursor.take() else {
            return Ok(false);
        };
        let batch = self.engine.scan(&start, &self.end, SCAN_BATCH)?;
        if batch.len() == SCAN_BATCH {
            if let Some((last, _)) = batch.last() {
                // smallest key sorting after `last`
                let mut resume = last.clone();
                resume.push(0);
                self.cursor = Some(resume);
            }
        }
        let refilled = !batch.is_empty();
        self.buffered = batch.into_iter();
        Ok(refilled)
    }
}

impl<E: KvEngine> Clone for Entries<'_, E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine,
            cursor: self.cursor.clone(),
            end: self.end.clone(),
            buffered: self.buffered.clone(),
        }
    }
}

impl<E: KvEngine> Iterator for Entries<'_, E> {
    type Item = Result<(u32, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.buffered.next() {
                // metadata keys sort between entry keys
                let Ok(index) = codec::decode_index(&key) else {
                    continue;
                };
                return Some(codec::decode_entry(&value).map(|entry| (index, entry)));
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    fn memory_store() -> LogStore<MemoryEngine> {
        LogStore::with_engine(MemoryEngine::new(), &LogOptions::default()).unwrap()
    }

    fn entries(terms: &[u32]) -> Vec<LogEntry> {
        terms
            .iter()
            .enumerate()
            .map(|(i, t)| LogEntry::new(*t, format!("cmd{i}").into_bytes()))
            .collect()
    }

    #[test]
    fn fresh_store_has_initial_metadata() {
        let store = memory_store();

        assert_eq!(store.first_applied(), None);
        assert_eq!(store.last_applied(), 0);
        assert_eq!(store.current_term(), 0);
        assert_eq!(store.commit_index(), 0);
        assert_eq!(store.voted_for(), None);
        assert!(store.is_open());
    }

    #[test]
    fn append_updates_metadata_per_index() {
        let mut store = memory_store();

        store.append(1, false, &entries(&[1, 1, 2])).unwrap();

        assert_eq!(store.first_applied(), Some(1));
        assert_eq!(store.last_applied(), 3);
        assert_eq!(store.current_term(), 2);
        assert_eq!(store.durable_metadata().unwrap(), store.metadata());
    }

    #[test]
    fn conflict_keeps_committed_prefix() {
        let mut store = memory_store();
        store.append(3, false, &[LogEntry::new(1, b"old".to_vec())]).unwrap();

        let err = store.append(1, false, &entries(&[2, 2, 2, 2])).unwrap_err();

        assert!(matches!(err, LogError::Conflict { index: 3 }));
        assert!(store.get(1).unwrap().is_some());
        assert!(store.get(2).unwrap().is_some());
        assert_eq!(store.get(3).unwrap().unwrap().command(), Some(&b"old"[..]));
        assert!(store.get(4).unwrap().is_none());
        assert_eq!(store.last_applied(), 2);
        assert_eq!(store.durable_metadata().unwrap(), store.metadata());
    }

    #[test]
    fn sentinel_index_is_rejected() {
        let mut store = memory_store();

        let err = store.append(u32::MAX, true, &entries(&[1])).unwrap_err();

        assert!(matches!(err, LogError::IndexOutOfRange { index } if index == u32::MAX));
        assert_eq!(store.first_applied(), None);
    }

    #[test]
    fn append_running_into_sentinel_stops_there() {
        let mut store = memory_store();

        let err = store.append(u32::MAX - 1, false, &entries(&[1, 1])).unwrap_err();

        assert!(matches!(err, LogError::IndexOutOfRange { .. }));
        assert_eq!(store.last_applied(), u32::MAX - 1);
    }

    #[test]
    fn operations_after_close_are_not_initialized() {
        let mut store = memory_store();
        store.close();
        store.close();

        assert!(!store.is_open());
        assert!(matches!(store.get(1), Err(LogError::NotInitialized)));
        assert!(matches!(store.append(1, false, &entries(&[1])), Err(LogError::NotInitialized)));
        assert!(matches!(store.set_current_term(2), Err(LogError::NotInitialized)));
        assert!(matches!(store.iter(), Err(LogError::NotInitialized)));
    }

    #[test]
    fn iterator_is_restartable() {
        let mut store = memory_store();
        store.append(1, false, &entries(&[1, 1, 1])).unwrap();

        let iter = store.entries(2, 3).unwrap();
        let first: Vec<u32> = iter.clone().map(|r| r.unwrap().0).collect();
        let second: Vec<u32> = iter.map(|r| r.unwrap().0).collect();

        assert_eq!(first, vec![2, 3]);
        assert_eq!(first, second);
    }

    #[test]
    fn sparse_log_iterates_only_stored_indices() {
        let mut store = memory_store();
        store.append(0, false, &entries(&[1])).unwrap();
        store.append(u32::MAX - 1, false, &entries(&[2])).unwrap();

        let indices: Vec<u32> = store.iter().unwrap().map(|r| r.unwrap().0).collect();

        assert_eq!(indices, vec![0, u32::MAX - 1]);
        assert_eq!(store.entries(1, u32::MAX - 2).unwrap().count(), 0);
    }

    #[test]
    fn iteration_spans_several_scan_batches() {
        let mut store = memory_store();
        let terms = vec![1; SCAN_BATCH * 2 + 5];
        store.append(1, false, &entries(&terms)).unwrap();

        let indices: Vec<u32> = store.iter().unwrap().map(|r| r.unwrap().0).collect();
        let expected: Vec<u32> = (1..=terms.len() as u32).collect();
        assert_eq!(indices, expected);

        // a clone taken mid-way resumes where the original stood
        let mut iter = store.entries(10, u32::MAX).unwrap();
        for _ in 0..SCAN_BATCH {
            iter.next();
        }
        let rest: Vec<u32> = iter.clone().map(|r| r.unwrap().0).collect();
        assert_eq!(rest.first(), Some(&(10 + SCAN_BATCH as u32)));
        assert_eq!(rest.len(), iter.count());
    }

    #[test]
    fn visitor_errors_propagate() {
        let mut store = memory_store();
        store.append(1, false, &entries(&[1, 1, 1])).unwrap();
        let mut seen = Vec::new();

        let result = store.for_each(|index, _| {
            seen.push(index);
            if index == 2 {
                Err(LogError::IoFailure("stop".to_string()))
            } else {
                Ok(())
            }
        });

        assert!(result.is_err());
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn delete_without_location_releases_engine() {
        let mut store = memory_store();
        store.delete().unwrap();
        assert!(!store.is_open());
        assert_eq!(store.location(), None);
    }
}
