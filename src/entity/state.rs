//! Map state shared by both entity roles.
//!
//! `MapCore` is what a passive hands over on promotion: the entries, the per-lane
//! sequence numbers, and the counters. Both roles execute operations through
//! [`ShardedStore::execute`], so a passive mirrors the active exactly.

use super::lanes::OrderedLanes;
use super::replication::ReplicatedOperation;
use super::stats::OperationStats;
use crate::codec::sync::ShardAssembler;
use crate::config::MapConfig;
use crate::map::types::{Entry, ErrorKind, MapOperation, MapResponse};
use crate::strategy::concurrency::{ConcurrencyKey, MapConcurrencyStrategy};

use dashmap::DashMap;
use std::collections::BTreeMap;

/// Per-lane bookkeeping, guarded by the lane mutex.
#[derive(Debug, Default)]
pub struct LaneState {
    /// Number of operations executed under this lane.
    pub sequence: u64,
    pub sync: SyncState,
    /// Transfer whose end-of-shard marker was last committed on this lane.
    pub committed_transfer: Option<u64>,
}

#[derive(Debug, Default)]
pub enum SyncState {
    #[default]
    Current,
    /// A reconciliation transfer is in flight; replays wait in `buffered`.
    Syncing(PendingSync),
}

#[derive(Debug)]
pub struct PendingSync {
    pub transfer: u64,
    /// Index of the next frame this transfer expects.
    pub next_index: u32,
    pub assembler: ShardAssembler,
    pub buffered: Vec<ReplicatedOperation>,
}

impl PendingSync {
    pub fn new(key: ConcurrencyKey, transfer: u64) -> Self {
        Self {
            transfer,
            next_index: 0,
            assembler: ShardAssembler::new(key),
            buffered: Vec::new(),
        }
    }
}

/// Entries partitioned by shard: `Shard -> Key -> Value`.
///
/// The store itself imposes no ordering; callers hold the matching lane.
pub struct ShardedStore {
    shards: DashMap<u32, DashMap<Vec<u8>, Vec<u8>>>,
    strategy: MapConcurrencyStrategy,
}

impl ShardedStore {
    pub fn new(strategy: MapConcurrencyStrategy) -> Self {
        let shards = DashMap::new();
        for shard in 0..strategy.shard_count() {
            shards.insert(shard, DashMap::new());
        }
        Self { shards, strategy }
    }

    pub fn execute(&self, operation: &MapOperation) -> MapResponse {
        match operation.key() {
            Some(key) => self.execute_keyed(self.strategy.shard_for(key), operation),
            None => self.execute_global(operation),
        }
    }

    fn execute_keyed(&self, shard: u32, operation: &MapOperation) -> MapResponse {
        let Some(map) = self.shards.get(&shard) else {
            return MapResponse::error(ErrorKind::Unavailable, format!("no shard {}", shard));
        };

        match operation {
            MapOperation::Put { key, value } => {
                MapResponse::Value(map.insert(key.clone(), value.clone()))
            }
            MapOperation::Get { key } => {
                MapResponse::Value(map.get(key).map(|v| v.value().clone()))
            }
            MapOperation::Remove { key } => MapResponse::Value(map.remove(key).map(|(_, v)| v)),
            MapOperation::PutIfAbsent { key, value } => match map.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(existing) => {
                    MapResponse::Value(Some(existing.get().clone()))
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                    MapResponse::Value(None)
                }
            },
            MapOperation::Replace { key, value } => match map.get_mut(key) {
                Some(mut current) => {
                    MapResponse::Value(Some(std::mem::replace(current.value_mut(), value.clone())))
                }
                None => MapResponse::Value(None),
            },
            MapOperation::ConditionalRemove { key, value } => {
                MapResponse::Bool(map.remove_if(key, |_, current| current == value).is_some())
            }
            MapOperation::ConditionalReplace {
                key,
                old_value,
                new_value,
            } => match map.get_mut(key) {
                Some(mut current) if current.value() == old_value => {
                    *current.value_mut() = new_value.clone();
                    MapResponse::Bool(true)
                }
                _ => MapResponse::Bool(false),
            },
            MapOperation::ContainsKey { key } => MapResponse::Bool(map.contains_key(key)),
            MapOperation::Clear
            | MapOperation::Size
            | MapOperation::ContainsValue { .. }
            | MapOperation::Entries => self.execute_global(operation),
        }
    }

    fn execute_global(&self, operation: &MapOperation) -> MapResponse {
        match operation {
            MapOperation::Clear => {
                for shard in self.shards.iter() {
                    shard.value().clear();
                }
                MapResponse::Void
            }
            MapOperation::Size => MapResponse::Count(self.len() as u64),
            MapOperation::ContainsValue { value } => MapResponse::Bool(
                self.shards
                    .iter()
                    .any(|shard| shard.value().iter().any(|entry| entry.value() == value)),
            ),
            MapOperation::Entries => {
                let mut entries: Vec<Entry> = self
                    .shards
                    .iter()
                    .flat_map(|shard| {
                        shard
                            .value()
                            .iter()
                            .map(|e| Entry::new(e.key().clone(), e.value().clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                entries.sort();
                MapResponse::Entries(entries)
            }
            keyed => self.execute_keyed(
                self.strategy.shard_for(keyed.key().unwrap_or_default()),
                keyed,
            ),
        }
    }

    /// Entries of one shard, sorted by key.
    pub fn snapshot(&self, shard: u32) -> Vec<Entry> {
        let mut entries = Vec::new();
        if let Some(map) = self.shards.get(&shard) {
            for entry in map.iter() {
                entries.push(Entry::new(entry.key().clone(), entry.value().clone()));
            }
        }
        entries.sort();
        entries
    }

    pub fn replace_shard(&self, shard: u32, entries: Vec<Entry>) {
        if let Some(map) = self.shards.get(&shard) {
            map.clear();
            for entry in entries {
                map.insert(entry.key, entry.value);
            }
        }
    }

    pub fn clear_shard(&self, shard: u32) {
        if let Some(map) = self.shards.get(&shard) {
            map.clear();
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let map = self.shards.get(&self.strategy.shard_for(key))?;
        map.get(key).map(|v| v.value().clone())
    }

    pub fn shard_len(&self, shard: u32) -> usize {
        self.shards.get(&shard).map(|map| map.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything one replica of the map owns.
pub struct MapCore {
    pub strategy: MapConcurrencyStrategy,
    pub store: ShardedStore,
    pub lanes: OrderedLanes<LaneState>,
    pub stats: OperationStats,
}

impl MapCore {
    pub fn new(config: &MapConfig) -> Self {
        let strategy = MapConcurrencyStrategy::new(config.shard_count);
        Self {
            strategy,
            store: ShardedStore::new(strategy),
            lanes: OrderedLanes::new(strategy.shard_count(), config.barrier_timeout()),
            stats: OperationStats::new(),
        }
    }

    /// Point-in-time counters. Read without taking any lane, so values for different
    /// shards may come from slightly different moments.
    pub fn statistics(&self) -> BTreeMap<String, u64> {
        let mut stats = self.stats.collect();
        stats.insert("entry_count".to_string(), self.store.len() as u64);
        stats.insert(
            "shard_count".to_string(),
            self.strategy.shard_count() as u64,
        );
        for shard in 0..self.strategy.shard_count() {
            stats.insert(
                format!("shard.{}.size", shard),
                self.store.shard_len(shard) as u64,
            );
        }
        stats
    }
}
