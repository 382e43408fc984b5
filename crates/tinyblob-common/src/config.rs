//! Configuration for the tinyblob engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Number of chunks in a store
///
/// The aggregate store is sliced into this many roughly equal spaces.
/// Fixed at runtime; chunks are never created or destroyed while the
/// store is open.
pub const CHUNK_COUNT: u32 = 10;

/// Default dead-to-live ratio (percent) that makes a chunk compactable
pub const COMPACT_THRESHOLD: u32 = 40;

/// How long compaction waits for in-flight writers before giving up
pub const COMPACT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Minimum number of chunks kept writable
pub const MIN_WRITABLE_CHUNK: u32 = 1;

/// Serialized width of an object id in bytes
pub const OBJECT_ID_LEN: usize = 8;

/// Store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the chunk data and index files
    pub data_dir: PathBuf,
    /// Aggregate store size in bytes; each chunk gets a tenth
    pub store_size: u64,
    /// Dead-to-live ratio (percent) that triggers compaction
    pub compact_threshold: u32,
    /// Wait limit for acquiring a chunk's compact lock
    pub compact_max_wait: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tinyblob"),
            store_size: 10 * 1024 * 1024 * 1024, // 10 GB
            compact_threshold: COMPACT_THRESHOLD,
            compact_max_wait: COMPACT_MAX_WAIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.compact_threshold, COMPACT_THRESHOLD);
        assert_eq!(config.compact_max_wait, COMPACT_MAX_WAIT);
        assert_eq!(config.store_size / u64::from(CHUNK_COUNT), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = StoreConfig {
            data_dir: PathBuf::from("/tmp/blob"),
            store_size: 1024,
            compact_threshold: 50,
            compact_max_wait: Duration::from_secs(5),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data_dir, config.data_dir);
        assert_eq!(back.store_size, 1024);
        assert_eq!(back.compact_max_wait, Duration::from_secs(5));
    }
}
