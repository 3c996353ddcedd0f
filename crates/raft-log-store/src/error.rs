//! # error
//!
//! why: give every log store failure one typed home
//! relations: returned by every public operation in this crate
//! what: LogError, Result alias, conversions from engine/codec/io errors

use crate::codec;
use crate::engine::EngineError;

/// errors reported by the log store
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// the store was closed (or deleted) before this call
    #[error("log store is not open")]
    NotInitialized,

    /// an entry already exists at `index` and overwrite was not requested
    #[error("entry at index {index} already exists")]
    Conflict { index: u32 },

    /// durable state disagrees with what was loaded or is incomplete
    #[error("log metadata is corrupt: {reason}")]
    Corruption { reason: String },

    /// the engine, the filesystem or the codec failed
    #[error("i/o failure: {0}")]
    IoFailure(String),

    /// `index` is reserved for the empty-log sentinel and cannot hold an entry
    #[error("index {index} is out of range")]
    IndexOutOfRange { index: u32 },
}

pub type Result<T> = std::result::Result<T, LogError>;

impl LogError {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        LogError::Corruption {
            reason: reason.into(),
        }
    }
}

impl From<EngineError> for LogError {
    fn from(e: EngineError) -> Self {
        match e {
            // only entry writes are guarded, and entry keys are indices
            EngineError::KeyExists(ref key) => match codec::decode_index(key) {
                Ok(index) => LogError::Conflict { index },
                Err(_) => LogError::IoFailure(e.to_string()),
            },
            EngineError::Backend(_) => LogError::IoFailure(e.to_string()),
        }
    }
}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        LogError::IoFailure(e.to_string())
    }
}

impl From<bincode::Error> for LogError {
    fn from(e: bincode::Error) -> Self {
        LogError::IoFailure(format!("codec: {e}"))
    }
}
