use crate::map::types::MapOperation;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the key-to-shard mapping. Bumped whenever `shard_for` changes.
pub const HASH_VERSION: u32 = 1;

/// Ordering domain of an operation.
///
/// Shard keys lie in `[0, shard_count)`; [`ConcurrencyKey::UNIVERSAL`] is reserved for
/// map-wide operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConcurrencyKey(pub u32);

impl ConcurrencyKey {
    pub const UNIVERSAL: ConcurrencyKey = ConcurrencyKey(u32::MAX);

    pub fn is_universal(self) -> bool {
        self == Self::UNIVERSAL
    }

    /// Shard index, or `None` for the universal key.
    pub fn shard(self) -> Option<u32> {
        if self.is_universal() {
            None
        } else {
            Some(self.0)
        }
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal() {
            write!(f, "universal")
        } else {
            write!(f, "shard-{}", self.0)
        }
    }
}

/// Maps operations to concurrency keys for a fixed shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapConcurrencyStrategy {
    shard_count: u32,
}

impl MapConcurrencyStrategy {
    /// `shard_count` is clamped into `[1, u32::MAX - 1]` so no shard collides with the
    /// universal key. Configuration validation rejects out-of-range counts earlier.
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.clamp(1, u32::MAX - 1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn hash_version(&self) -> u32 {
        HASH_VERSION
    }

    /// Shard owning `key`.
    pub fn shard_for(&self, key: &[u8]) -> u32 {
        crc32fast::hash(key) % self.shard_count
    }

    pub fn concurrency_key(&self, operation: &MapOperation) -> ConcurrencyKey {
        match operation.key() {
            Some(key) => ConcurrencyKey(self.shard_for(key)),
            None => ConcurrencyKey::UNIVERSAL,
        }
    }

    /// Every key an operation can map to: the universal key first, then each shard
    /// in ascending order.
    pub fn all_keys(&self) -> Vec<ConcurrencyKey> {
        std::iter::once(ConcurrencyKey::UNIVERSAL)
            .chain((0..self.shard_count).map(ConcurrencyKey))
            .collect()
    }

    pub fn contains(&self, key: ConcurrencyKey) -> bool {
        key.is_universal() || key.0 < self.shard_count
    }
}
