//! Read-path configuration stored at `<repo>/db/fsfs.toml`
//!
//! ```toml
//! max_chain_length = 1024
//! verify_sha1 = false
//!
//! [cache]
//! fulltext_bytes = 67108864
//! max_fulltext_size = 1048576
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

pub const CONFIG_FILE: &str = "fsfs.toml";

/// Engine tunables; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Links followed before a delta chain is declared cyclic.
    pub max_chain_length: usize,
    /// Verify the stored SHA-1 as well as the MD5 when one is recorded.
    pub verify_sha1: bool,
    /// Read whole P2L blocks for logically addressed revisions.
    pub block_read: bool,
    /// Block size for block reads; a power of two.
    pub block_size: u64,
    pub cache: CacheConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            max_chain_length: 1024,
            verify_sha1: false,
            block_read: true,
            block_size: 64 * 1024,
            cache: CacheConfig::default(),
        }
    }
}

/// Byte budgets for the cache hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub window_bytes: usize,
    pub combined_bytes: usize,
    pub fulltext_bytes: usize,
    pub node_bytes: usize,
    pub dir_bytes: usize,
    pub prop_bytes: usize,
    pub changes_bytes: usize,
    pub index_bytes: usize,
    /// Representations larger than this never enter the fulltext cache.
    pub max_fulltext_size: u64,
    /// Combined windows larger than this are not cached.
    pub max_combined_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_bytes: 16 * 1024 * 1024,
            combined_bytes: 16 * 1024 * 1024,
            fulltext_bytes: 64 * 1024 * 1024,
            node_bytes: 8 * 1024 * 1024,
            dir_bytes: 8 * 1024 * 1024,
            prop_bytes: 4 * 1024 * 1024,
            changes_bytes: 4 * 1024 * 1024,
            index_bytes: 4 * 1024 * 1024,
            max_fulltext_size: 1024 * 1024,
            max_combined_size: 256 * 1024,
        }
    }
}

impl CacheConfig {
    /// A configuration under which every cache always misses
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl FsConfig {
    /// Load `db/fsfs.toml` below `repo_root`, or the defaults when absent.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join("db").join(CONFIG_FILE);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(FsError::io("reading config", &path, e)),
        };
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let config: FsConfig =
            toml::from_str(data).map_err(|e| FsError::Config(format!("failed to parse {}: {}", CONFIG_FILE, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FsError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chain_length == 0 {
            return Err(FsError::Config("max_chain_length must be at least 1".into()));
        }
        if !self.block_size.is_power_of_two() {
            return Err(FsError::Config(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        Ok(())
    }
}
