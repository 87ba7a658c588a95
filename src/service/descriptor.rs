use crate::codec::operation::OperationCodec;
use crate::codec::sync::ReconciliationCodec;
use crate::config::MapConfig;
use crate::entity::active::ActiveMapEntity;
use crate::entity::passive::PassiveMapEntity;
use crate::error::EntityError;
use crate::strategy::concurrency::MapConcurrencyStrategy;

use std::sync::Arc;

/// Type name hosts use to ask for a clustered map.
pub const ENTITY_TYPE: &str = "clustered_map::ConcurrentClusteredMap";

/// Version of the entity contract. Covers the wire formats and the concurrency
/// hash; nodes on different versions must not replicate to each other.
pub const ENTITY_VERSION: u64 = 1;

/// Factory for the clustered map entity.
///
/// Every method taking `configuration` parses the same JSON blob into a
/// [`MapConfig`]; an empty blob means defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapEntityService;

impl MapEntityService {
    pub fn new() -> Self {
        Self
    }

    pub fn version(&self) -> u64 {
        ENTITY_VERSION
    }

    pub fn handles_entity_type(&self, type_name: &str) -> bool {
        type_name == ENTITY_TYPE
    }

    pub fn construct_active(&self, configuration: &[u8]) -> Result<Arc<ActiveMapEntity>, EntityError> {
        let config = MapConfig::from_bytes(configuration)?;
        tracing::info!(entity = %config.entity_name, shards = config.shard_count, "constructing active");
        ActiveMapEntity::new(config)
    }

    pub fn construct_passive(&self, configuration: &[u8]) -> Result<Arc<PassiveMapEntity>, EntityError> {
        let config = MapConfig::from_bytes(configuration)?;
        tracing::info!(entity = %config.entity_name, shards = config.shard_count, "constructing passive");
        Ok(Arc::new(PassiveMapEntity::new(config)?))
    }

    pub fn concurrency_strategy(&self, configuration: &[u8]) -> Result<MapConcurrencyStrategy, EntityError> {
        let config = MapConfig::from_bytes(configuration)?;
        Ok(MapConcurrencyStrategy::new(config.shard_count))
    }

    pub fn operation_codec(&self) -> OperationCodec {
        OperationCodec::new()
    }

    pub fn reconciliation_codec(&self, configuration: &[u8]) -> Result<ReconciliationCodec, EntityError> {
        let config = MapConfig::from_bytes(configuration)?;
        Ok(ReconciliationCodec::new(
            config.sync_chunk_entries,
            config.sync_chunk_bytes,
        ))
    }
}
