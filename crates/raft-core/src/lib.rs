//! # raft-core
//!
//! why: share the protocol-level values that the consensus module and the log store agree on
//! relations: produced by the consensus module, persisted by raft-log-store
//! what: log entries and their payloads, node identifiers, append outcomes

pub mod log;

pub use log::{AppendResult, EntryPayload, LogEntry, NodeId};
