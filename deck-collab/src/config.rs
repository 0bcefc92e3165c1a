//! Runtime configuration.
//!
//! Every struct derives `Deserialize` with `#[serde(default)]`, so a partial
//! JSON document only overrides the keys it names:
//!
//! ```
//! use deck_collab::config::SyncConfig;
//!
//! let config = SyncConfig::from_json(r#"{ "pool": { "max_connections": 8 } }"#).unwrap();
//! assert_eq!(config.pool.max_connections, 8);
//! assert_eq!(config.shards.max_loaded_documents, 5);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lease length for component locks. Not configurable.
pub const LOCK_TTL: Duration = Duration::from_millis(30_000);

/// Connection pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live connections (in use, idle and being created)
    pub max_connections: usize,
    /// Idle connections older than this are destroyed by the sweep
    pub idle_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Give up on a queued `acquire` after this long (None = wait forever)
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            idle_timeout_ms: 60_000,
            cleanup_interval_ms: 30_000,
            acquire_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// Outbound delta batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    pub max_batch_size_bytes: usize,
    pub max_batch_delay_ms: u64,
    /// Deltas larger than this get a secondary LZ4 pass
    pub compression_threshold_bytes: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            max_batch_size_bytes: 51_200,
            max_batch_delay_ms: 500,
            compression_threshold_bytes: 10_240,
        }
    }
}

impl CompressorConfig {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }
}

/// Shard assignment and residency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub max_loaded_documents: usize,
    pub slides_per_shard: usize,
    pub unload_interval_ms: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_loaded_documents: 5,
            slides_per_shard: 10,
            unload_interval_ms: 60_000,
        }
    }
}

impl ShardConfig {
    pub fn unload_interval(&self) -> Duration {
        Duration::from_millis(self.unload_interval_ms)
    }
}

/// Top-level configuration for one [`crate::CollabContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub pool: PoolConfig,
    pub compressor: CompressorConfig,
    pub shards: ShardConfig,
    /// Cadence of the expired-lock sweep
    pub lock_sweep_interval_ms: u64,
    /// How long a new connection waits for the initial handshake
    pub sync_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            compressor: CompressorConfig::default(),
            shards: ShardConfig::default(),
            lock_sweep_interval_ms: 5_000,
            sync_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Parse a (possibly partial) JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lock_sweep_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
