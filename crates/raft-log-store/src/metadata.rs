//! # metadata
//!
//! why: keep the protocol-critical scalars in memory without ever running ahead of disk
//! relations: owned by store.rs, re-read by consistency.rs, encoded with codec.rs
//! what: MetaKey key layout, Metadata values, MetadataRegistry mirror
//!
//! Setters apply no validation. Monotonic terms and `commit_index <=
//! last_applied` are the caller's preconditions.

use raft_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::engine::{KvEngine, WriteBatch};
use crate::error::{LogError, Result};

/// reserved 2-byte keys; entry keys are 4 bytes so the two never collide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    FirstApplied,
    LastApplied,
    CurrentTerm,
    CommitIndex,
    VotedFor,
}

impl MetaKey {
    /// keys every initialized log holds; `VF` is absent while no vote is cast
    pub const REQUIRED: [MetaKey; 4] = [
        MetaKey::FirstApplied,
        MetaKey::LastApplied,
        MetaKey::CurrentTerm,
        MetaKey::CommitIndex,
    ];

    pub const ALL: [MetaKey; 5] = [
        MetaKey::FirstApplied,
        MetaKey::LastApplied,
        MetaKey::CurrentTerm,
        MetaKey::CommitIndex,
        MetaKey::VotedFor,
    ];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            MetaKey::FirstApplied => b"FA",
            MetaKey::LastApplied => b"LA",
            MetaKey::CurrentTerm => b"CT",
            MetaKey::CommitIndex => b"CX",
            MetaKey::VotedFor => b"VF",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetaKey::FirstApplied => "first_applied",
            MetaKey::LastApplied => "last_applied",
            MetaKey::CurrentTerm => "current_term",
            MetaKey::CommitIndex => "commit_index",
            MetaKey::VotedFor => "voted_for",
        }
    }
}

/// the five durable scalars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// oldest retained index, `None` while the log is empty
    pub first_applied: Option<u32>,
    /// newest appended index, meaningful only once `first_applied` is set
    pub last_applied: u32,
    pub current_term: u32,
    pub commit_index: u32,
    pub voted_for: Option<NodeId>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            first_applied: None,
            last_applied: 0,
            current_term: 0,
            commit_index: 0,
            voted_for: None,
        }
    }
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.first_applied.is_none()
    }

    /// read all five scalars from the engine
    ///
    /// every key but `VF` must be present; a missing one is corruption.
    pub fn read<E: KvEngine + ?Sized>(engine: &E) -> Result<Self> {
        let first_applied = codec::decode_first_applied(&required(engine, MetaKey::FirstApplied)?)?;
        let last_applied = codec::decode_index(&required(engine, MetaKey::LastApplied)?)?;
        let current_term = codec::decode_index(&required(engine, MetaKey::CurrentTerm)?)?;
        let commit_index = codec::decode_index(&required(engine, MetaKey::CommitIndex)?)?;
        let voted_for = engine
            .get(MetaKey::VotedFor.as_bytes())?
            .map(|bytes| codec::decode_voter(&bytes))
            .transpose()?;

        Ok(Self {
            first_applied,
            last_applied,
            current_term,
            commit_index,
            voted_for,
        })
    }

    /// stage every scalar into `batch`
    pub fn stage_all(&self, batch: &mut WriteBatch) -> Result<()> {
        for key in MetaKey::ALL {
            self.stage(key, batch)?;
        }
        Ok(())
    }

    /// stage only the scalars that differ from `current`
    pub fn stage_changes(&self, current: &Metadata, batch: &mut WriteBatch) -> Result<()> {
        for key in self.differing(current) {
            self.stage(key, batch)?;
        }
        Ok(())
    }

    /// keys whose value differs between `self` and `other`
    pub fn differing(&self, other: &Metadata) -> Vec<MetaKey> {
        MetaKey::ALL
            .into_iter()
            .filter(|key| match key {
                MetaKey::FirstApplied => self.first_applied != other.first_applied,
                MetaKey::LastApplied => self.last_applied != other.last_applied,
                MetaKey::CurrentTerm => self.current_term != other.current_term,
                MetaKey::CommitIndex => self.commit_index != other.commit_index,
                MetaKey::VotedFor => self.voted_for != other.voted_for,
            })
            .collect()
    }

    /// human-readable value of one scalar, `-1`/`none` for the empty forms
    pub fn describe(&self, key: MetaKey) -> String {
        match key {
            MetaKey::FirstApplied => self
                .first_applied
                .map_or_else(|| "-1".to_string(), |i| i.to_string()),
            MetaKey::LastApplied => self.last_applied.to_string(),
            MetaKey::CurrentTerm => self.current_term.to_string(),
            MetaKey::CommitIndex => self.commit_index.to_string(),
            MetaKey::VotedFor => self
                .voted_for
                .map_or_else(|| "none".to_string(), |id| id.to_string()),
        }
    }

    fn stage(&self, key: MetaKey, batch: &mut WriteBatch) -> Result<()> {
        let k = key.as_bytes();
        match key {
            MetaKey::FirstApplied => {
                batch.put(k, codec::encode_first_applied(self.first_applied));
            }
            MetaKey::LastApplied => {
                batch.put(k, codec::encode_index(self.last_applied));
            }
            MetaKey::CurrentTerm => {
                batch.put(k, codec::encode_index(self.current_term));
            }
            MetaKey::CommitIndex => {
                batch.put(k, codec::encode_index(self.commit_index));
            }
            MetaKey::VotedFor => match self.voted_for {
                Some(id) => {
                    batch.put(k, codec::encode_voter(id)?);
                }
                None => {
                    batch.delete(k);
                }
            },
        }
        Ok(())
    }
}

fn required<E: KvEngine + ?Sized>(engine: &E, key: MetaKey) -> Result<Vec<u8>> {
    engine
        .get(key.as_bytes())?
        .ok_or_else(|| LogError::corruption(format!("metadata key {} is missing", key.name())))
}

/// in-memory mirror of the durable scalars
///
/// the mirror only ever moves after the engine accepted the write carrying
/// the new values.
#[derive(Debug)]
pub struct MetadataRegistry {
    current: Metadata,
}

impl MetadataRegistry {
    /// whether the engine holds no log yet
    ///
    /// fresh means no metadata key and no entry at all. A partial set of
    /// metadata keys, or entries without metadata, is corruption.
    pub fn is_fresh<E: KvEngine + ?Sized>(engine: &E) -> Result<bool> {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for key in MetaKey::ALL {
            if engine.get(key.as_bytes())?.is_some() {
                present.push(key);
            } else if MetaKey::REQUIRED.contains(&key) {
                missing.push(key.name());
            }
        }

        if present.is_empty() {
            let stored = engine.scan(&codec::entry_key(0), &codec::entry_key(u32::MAX), 1)?;
            if stored.iter().any(|(key, _)| codec::decode_index(key).is_ok()) {
                return Err(LogError::corruption("log entries present without metadata"));
            }
            return Ok(true);
        }
        if !missing.is_empty() {
            return Err(LogError::corruption(format!(
                "metadata keys {} are missing",
                missing.join(", ")
            )));
        }
        Ok(false)
    }

    /// persist the initial scalars and mirror them
    pub fn initialize<E: KvEngine + ?Sized>(engine: &E) -> Result<Self> {
        let initial = Metadata::default();
        let mut batch = WriteBatch::new();
        initial.stage_all(&mut batch)?;
        engine.write(batch)?;
        Ok(Self { current: initial })
    }

    /// mirror whatever the engine currently holds
    pub fn load<E: KvEngine + ?Sized>(engine: &E) -> Result<Self> {
        Ok(Self {
            current: Metadata::read(engine)?,
        })
    }

    pub fn get(&self) -> &Metadata {
        &self.current
    }

    /// write `batch` plus the scalars that changed in `next`, then adopt `next`
    ///
    /// on error the mirror is left as it was.
    pub fn commit<E: KvEngine + ?Sized>(
        &mut self,
        engine: &E,
        next: Metadata,
        mut batch: WriteBatch,
    ) -> Result<()> {
        next.stage_changes(&self.current, &mut batch)?;
        if !batch.is_empty() {
            engine.write(batch)?;
        }
        self.current = next;
        Ok(())
    }

    pub fn set_current_term<E: KvEngine + ?Sized>(&mut self, engine: &E, term: u32) -> Result<()> {
        let next = Metadata {
            current_term: term,
            ..self.current
        };
        self.commit(engine, next, WriteBatch::new())
    }

    pub fn set_voted_for<E: KvEngine + ?Sized>(
        &mut self,
        engine: &E,
        voted_for: Option<NodeId>,
    ) -> Result<()> {
        let next = Metadata {
            voted_for,
            ..self.current
        };
        self.commit(engine, next, WriteBatch::new())
    }

    pub fn set_commit_index<E: KvEngine + ?Sized>(&mut self, engine: &E, index: u32) -> Result<()> {
        let next = Metadata {
            commit_index: index,
            ..self.current
        };
        self.commit(engine, next, WriteBatch::new())
    }
}
