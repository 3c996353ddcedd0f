//! # log
//!
//! why: describe what a replicated log holds, independent of how it is stored
//! relations: encoded by raft-log-store's codec, keyed there by index
//! what: LogEntry, EntryPayload, NodeId, AppendResult

use serde::{Deserialize, Serialize};

/// Identifier of a cluster member, as recorded in `voted_for`.
pub type NodeId = u64;

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque command bytes destined for the state machine
    Command(Vec<u8>),
    /// Internal marker with no state machine effect (e.g. a new leader's no-op)
    Blank,
}

/// A single entry in the replicated log
///
/// The index is not part of the entry: it is implied by the position the
/// entry is stored at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u32,
    /// What the entry carries
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a new command entry
    pub fn new(term: u32, command: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            payload: EntryPayload::Command(command.into()),
        }
    }

    /// Create a marker entry with no command
    pub fn blank(term: u32) -> Self {
        Self {
            term,
            payload: EntryPayload::Blank,
        }
    }

    /// The command bytes, or `None` for marker entries
    pub fn command(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Command(bytes) => Some(bytes),
            EntryPayload::Blank => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self.payload, EntryPayload::Blank)
    }
}

/// Outcome of a conflict-detecting append.
///
/// On rejection `index` is the `prev_index` the leader sent, which it uses as
/// a hint when backing off. On success it is the last index written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResult {
    pub success: bool,
    pub index: u32,
}

impl AppendResult {
    pub fn accepted(index: u32) -> Self {
        Self { success: true, index }
    }

    pub fn rejected(prev_index: u32) -> Self {
        Self {
            success: false,
            index: prev_index,
        }
    }
}
