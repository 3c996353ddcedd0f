//! # raft-log-store
//!
//! why: durable storage for a raft log and the scalars the protocol must never lose
//! relations: consumed by the consensus module, stores raft-core's LogEntry, persists via redb
//! what: LogStore, its ordered key-value engine seam, codec, metadata mirror, startup checks
//!
//! On disk a location is a directory holding one engine file. Inside it,
//! five 2-byte keys (`FA`, `LA`, `CT`, `CX`, `VF`) hold the metadata and
//! every entry lives under the 4-byte big-endian encoding of its index.

pub mod codec;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod store;

pub use config::LogOptions;
pub use engine::{EngineError, KvEngine, KvPair, MemoryEngine, RedbEngine, WriteBatch};
pub use error::{LogError, Result};
pub use metadata::{MetaKey, Metadata};
pub use store::{Entries, LogStore};

pub use raft_core::{AppendResult, EntryPayload, LogEntry, NodeId};
