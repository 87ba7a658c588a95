//! Entity configuration.
//!
//! The host hands every entity an opaque configuration blob at construction time. For
//! this entity the blob is JSON; an empty blob means "all defaults".

use crate::error::EntityError;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for every `*_timeout_ms` setting: one day.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// When the active acknowledges a client relative to passive replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Wait for every in-sync passive before answering the client.
    #[default]
    ReplicateThenAck,
    /// Queue the replication and answer immediately.
    AckThenReplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Name used in log spans. Has no effect on behavior.
    pub entity_name: String,
    pub shard_count: u32,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
    pub ack_policy: AckPolicy,
    pub replication_timeout_ms: u64,
    pub barrier_timeout_ms: u64,
    pub sync_chunk_entries: usize,
    pub sync_chunk_bytes: usize,
    pub reconcile_attempts: u32,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            entity_name: "clustered-map".to_string(),
            shard_count: 16,
            max_key_bytes: 64 * 1024,
            max_value_bytes: 8 * 1024 * 1024,
            ack_policy: AckPolicy::ReplicateThenAck,
            replication_timeout_ms: 2_000,
            barrier_timeout_ms: 30_000,
            sync_chunk_entries: 512,
            sync_chunk_bytes: 1024 * 1024,
            reconcile_attempts: 5,
        }
    }
}

impl MapConfig {
    /// Parses the host-supplied configuration blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EntityError> {
        let config = if bytes.iter().all(u8::is_ascii_whitespace) {
            Self::default()
        } else {
            serde_json::from_slice(bytes)
                .map_err(|e| EntityError::Config(format!("invalid configuration: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EntityError> {
        if self.shard_count == 0 || self.shard_count == u32::MAX {
            return Err(EntityError::Config(format!(
                "shard_count must be in [1, {}), got {}",
                u32::MAX,
                self.shard_count
            )));
        }
        for (name, value) in [
            ("replication_timeout_ms", self.replication_timeout_ms),
            ("barrier_timeout_ms", self.barrier_timeout_ms),
        ] {
            if value > MAX_TIMEOUT_MS {
                return Err(EntityError::Config(format!(
                    "{} must be at most {}, got {}",
                    name, MAX_TIMEOUT_MS, value
                )));
            }
        }
        if self.sync_chunk_entries == 0 {
            return Err(EntityError::Config(
                "sync_chunk_entries must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }
}
