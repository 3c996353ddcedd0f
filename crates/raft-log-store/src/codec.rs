//! # codec
//!
//! why: turn indices, scalars, entries and voter ids into the bytes the engine stores
//! relations: used by metadata.rs for the scalars and by store.rs for entry keys/values
//! what: 4-byte big-endian integers, versioned bincode envelope for structured values
//!
//! Integers are big-endian so that entry keys sort like their numeric index
//! under the engine's byte-wise key ordering.

use bincode::Options;
use raft_core::{LogEntry, NodeId};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{LogError, Result};

/// Schema byte leading every structured value.
pub const SCHEMA_VERSION: u8 = 1;

/// Width of every encoded integer and of every entry key.
pub const INT_WIDTH: usize = 4;

/// On-disk form of "no first entry yet": the big-endian bytes of -1.
const EMPTY_FIRST_APPLIED: u32 = u32::MAX;

pub fn encode_index(value: u32) -> [u8; INT_WIDTH] {
    value.to_be_bytes()
}

pub fn decode_index(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; INT_WIDTH] = bytes.try_into().map_err(|_| {
        LogError::IoFailure(format!(
            "codec: expected a {INT_WIDTH}-byte integer, found {} bytes",
            bytes.len()
        ))
    })?;
    Ok(u32::from_be_bytes(raw))
}

/// Key under which the entry at `index` is stored.
pub fn entry_key(index: u32) -> [u8; INT_WIDTH] {
    encode_index(index)
}

/// Whether `index` may hold an entry; the sentinel value is reserved.
pub fn is_storable_index(index: u32) -> bool {
    index != EMPTY_FIRST_APPLIED
}

pub fn encode_first_applied(first: Option<u32>) -> [u8; INT_WIDTH] {
    encode_index(first.unwrap_or(EMPTY_FIRST_APPLIED))
}

pub fn decode_first_applied(bytes: &[u8]) -> Result<Option<u32>> {
    let raw = decode_index(bytes)?;
    Ok((raw != EMPTY_FIRST_APPLIED).then_some(raw))
}

pub fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    seal(entry)
}

pub fn decode_entry(bytes: &[u8]) -> Result<LogEntry> {
    unseal(bytes)
}

pub fn encode_voter(voter: NodeId) -> Result<Vec<u8>> {
    seal(&voter)
}

pub fn decode_voter(bytes: &[u8]) -> Result<NodeId> {
    unseal(bytes)
}

fn seal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(value)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(SCHEMA_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

fn unseal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| LogError::IoFailure("codec: empty value".to_string()))?;
    if *version != SCHEMA_VERSION {
        return Err(LogError::IoFailure(format!(
            "codec: unsupported schema version {version}"
        )));
    }
    // bounding by the input length stops a corrupt length prefix from
    // triggering a huge allocation
    let value = bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(body.len() as u64)
        .deserialize(body)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_keys_sort_like_numbers() {
        let mut keys: Vec<[u8; 4]> = [300u32, 2, 70_000, 1, 256]
            .iter()
            .map(|i| entry_key(*i))
            .collect();
        keys.sort();
        let decoded: Vec<u32> = keys.iter().map(|k| decode_index(k).unwrap()).collect();
        assert_eq!(decoded, vec![1, 2, 256, 300, 70_000]);
    }

    #[test]
    fn index_is_big_endian() {
        assert_eq!(encode_index(1), [0, 0, 0, 1]);
        assert_eq!(encode_index(0x0102_0304), [1, 2, 3, 4]);
    }

    #[test]
    fn decode_index_rejects_wrong_width() {
        assert!(matches!(decode_index(&[0, 1]), Err(LogError::IoFailure(_))));
        assert!(matches!(decode_index(&[0; 5]), Err(LogError::IoFailure(_))));
    }

    #[test]
    fn empty_first_applied_is_minus_one_on_disk() {
        assert_eq!(encode_first_applied(None), (-1i32).to_be_bytes());
        assert_eq!(decode_first_applied(&(-1i32).to_be_bytes()).unwrap(), None);
        assert_eq!(decode_first_applied(&[0, 0, 0, 5]).unwrap(), Some(5));
        assert!(!is_storable_index(u32::MAX));
        assert!(is_storable_index(0));
    }

    #[test]
    fn entry_keeps_arbitrary_payload_bytes() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let entry = LogEntry::new(4, payload);
        let bytes = encode_entry(&entry).unwrap();

        assert_eq!(bytes[0], SCHEMA_VERSION);
        assert_eq!(decode_entry(&bytes).unwrap(), entry);
    }

    #[test]
    fn blank_and_command_entries_are_distinguished() {
        let blank = encode_entry(&LogEntry::blank(2)).unwrap();
        let empty_cmd = encode_entry(&LogEntry::new(2, Vec::new())).unwrap();

        assert_ne!(blank, empty_cmd);
        assert!(decode_entry(&blank).unwrap().is_blank());
        assert!(!decode_entry(&empty_cmd).unwrap().is_blank());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut bytes = encode_entry(&LogEntry::new(1, b"x".to_vec())).unwrap();
        bytes[0] = 9;
        assert!(matches!(decode_entry(&bytes), Err(LogError::IoFailure(_))));
    }

    #[test]
    fn truncated_and_padded_values_are_rejected() {
        let bytes = encode_entry(&LogEntry::new(1, b"payload".to_vec())).unwrap();

        assert!(decode_entry(&bytes[..bytes.len() - 2]).is_err());
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(decode_entry(&padded).is_err());
        assert!(decode_entry(&[]).is_err());
    }

    #[test]
    fn huge_length_prefix_does_not_allocate() {
        // term 1, command variant, then a length prefix claiming u64::MAX bytes
        let mut bytes = vec![SCHEMA_VERSION];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(decode_entry(&bytes).is_err());
    }

    #[test]
    fn voter_ids_decode() {
        let bytes = encode_voter(42).unwrap();
        assert_eq!(decode_voter(&bytes).unwrap(), 42);
        assert!(decode_voter(&bytes[..3]).is_err());
    }
}
