//! # consistency
//!
//! why: refuse to start on top of metadata that disagrees with what was just loaded
//! relations: run by store.rs on every reopen, compares metadata.rs values with the engine
//! what: verify(), byte-for-byte comparison of the five scalars
//!
//! The store is the only writer of its location, so any divergence means
//! tampering or an earlier partial write. Both are fatal.

use crate::codec;
use crate::engine::{BatchOp, KvEngine, WriteBatch};
use crate::error::{LogError, Result};
use crate::metadata::{MetaKey, Metadata};

/// compare `mirror` against the engine's bytes for every metadata key
///
/// with `check_last_entry`, a non-empty log must also hold an entry at
/// `last_applied`.
pub fn verify<E: KvEngine + ?Sized>(
    mirror: &Metadata,
    engine: &E,
    check_last_entry: bool,
) -> Result<()> {
    let mut expected = WriteBatch::new();
    mirror.stage_all(&mut expected)?;

    // stage_all emits exactly one op per key, in MetaKey::ALL order
    for (meta_key, op) in MetaKey::ALL.into_iter().zip(expected.ops()) {
        let (raw_key, want) = match op {
            BatchOp::Put { key, value } | BatchOp::PutIfAbsent { key, value } => {
                (key.as_slice(), Some(value.as_slice()))
            }
            BatchOp::Delete { key } => (key.as_slice(), None),
        };
        let found = engine.get(raw_key)?;
        if found.as_deref() != want {
            tracing::error!(
                key = meta_key.name(),
                in_memory = %mirror.describe(meta_key),
                durable = ?found,
                "metadata mismatch between memory and disk"
            );
            return Err(LogError::corruption(format!(
                "{} is {} in memory but {:02x?} on disk",
                meta_key.name(),
                mirror.describe(meta_key),
                found
            )));
        }
    }

    if check_last_entry && !mirror.is_empty() {
        let key = codec::entry_key(mirror.last_applied);
        if engine.get(&key)?.is_none() {
            tracing::error!(
                last_applied = mirror.last_applied,
                "no entry stored at last_applied"
            );
            return Err(LogError::corruption(format!(
                "no entry stored at last_applied {}",
                mirror.last_applied
            )));
        }
    }

    Ok(())
}
