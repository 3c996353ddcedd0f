//! # config
//!
//! why: let the embedding process tune how a log location is opened
//! relations: consumed by LogStore::open, mapped onto engine.rs's RedbConfig
//! what: LogOptions with serde defaults, json loading

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::RedbConfig;
use crate::error::{LogError, Result};

/// options for opening a log location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// create the location when it does not exist yet
    pub create_if_missing: bool,
    /// engine file inside the location directory
    pub file_name: String,
    /// engine page cache size, engine default when unset
    pub cache_size_bytes: Option<usize>,
    /// on reopen, also require an entry at last_applied
    pub verify_last_entry: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            file_name: "raft-log.redb".to_string(),
            cache_size_bytes: None,
            verify_last_entry: true,
        }
    }
}

impl LogOptions {
    /// parse options from a json document; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LogError::IoFailure(format!("invalid log options: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub(crate) fn engine_config(&self) -> RedbConfig {
        RedbConfig {
            cache_size_bytes: self.cache_size_bytes,
        }
    }
}
