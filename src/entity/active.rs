//! Active map entity: canonical execution and the source of every reconciliation.

use super::replication::{
    PassiveHandle, PassiveId, PassiveLink, PassiveStatus, PendingAck, ReplicatedOperation,
    SyncPosition,
};
use super::state::MapCore;
use super::stats;
use crate::codec::operation::OperationCodec;
use crate::codec::sync::{ReconciliationCodec, ShardSnapshot};
use crate::config::{AckPolicy, MapConfig};
use crate::error::EntityError;
use crate::map::types::{ErrorKind, MapOperation, MapResponse};
use crate::strategy::concurrency::{ConcurrencyKey, MapConcurrencyStrategy};

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

pub struct ActiveMapEntity {
    core: Arc<MapCore>,
    config: MapConfig,
    operation_codec: OperationCodec,
    sync_codec: ReconciliationCodec,
    passives: DashMap<PassiveId, Arc<PassiveHandle>>,
    lagging_tx: mpsc::UnboundedSender<PassiveId>,
    poisoned: AtomicBool,
    span: tracing::Span,
}

impl ActiveMapEntity {
    /// Creates an empty active entity. Must run inside a Tokio runtime: the
    /// reconciliation supervisor is spawned here.
    pub fn new(config: MapConfig) -> Result<Arc<Self>, EntityError> {
        config.validate()?;
        let core = Arc::new(MapCore::new(&config));
        Ok(Self::from_core(core, config))
    }

    /// Takes over existing state, as on promotion of a passive.
    pub(crate) fn from_core(core: Arc<MapCore>, config: MapConfig) -> Arc<Self> {
        let span = tracing::info_span!("clustered_map", entity = %config.entity_name, role = "active");
        let (lagging_tx, lagging_rx) = mpsc::unbounded_channel();
        let entity = Arc::new(Self {
            core,
            sync_codec: ReconciliationCodec::new(config.sync_chunk_entries, config.sync_chunk_bytes),
            config,
            operation_codec: OperationCodec::new(),
            passives: DashMap::new(),
            lagging_tx,
            poisoned: AtomicBool::new(false),
            span: span.clone(),
        });

        tokio::spawn(supervise(Arc::downgrade(&entity), lagging_rx).instrument(span));
        entity
    }

    pub fn strategy(&self) -> &MapConcurrencyStrategy {
        &self.core.strategy
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &MapCore {
        &self.core
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn check_healthy(&self) -> Result<(), EntityError> {
        if self.is_poisoned() {
            return Err(EntityError::Poisoned);
        }
        Ok(())
    }

    fn poison_on_fatal(&self, error: EntityError) -> EntityError {
        if error.is_fatal() && !self.poisoned.swap(true, Ordering::SeqCst) {
            self.span.in_scope(|| {
                tracing::error!("entity failed fatally: {}", error);
            });
        }
        error
    }

    /// Handles one raw request from the operation channel.
    ///
    /// Malformed requests get an error response; an unknown opcode is returned as a
    /// protocol failure the host must treat as fatal to the connection.
    pub async fn invoke(&self, request: &[u8]) -> Result<Vec<u8>, EntityError> {
        let response = match self.operation_codec.decode_operation(request) {
            Ok(operation) => self.apply(operation).await?,
            Err(e) if e.is_fatal() => return Err(EntityError::Protocol(e)),
            Err(e) => {
                self.core.stats.record_rejected();
                tracing::debug!(parent: &self.span, "malformed request: {}", e);
                MapResponse::error(ErrorKind::MalformedRequest, e.to_string())
            }
        };
        Ok(self.operation_codec.encode_response(&response)?)
    }

    fn check_limits(&self, operation: &MapOperation) -> Option<MapResponse> {
        if let Some(key) = operation.key()
            && key.len() > self.config.max_key_bytes
        {
            return Some(MapResponse::error(
                ErrorKind::PayloadTooLarge,
                format!("key of {} bytes exceeds limit of {}", key.len(), self.config.max_key_bytes),
            ));
        }
        for value in operation.values() {
            if value.len() > self.config.max_value_bytes {
                return Some(MapResponse::error(
                    ErrorKind::PayloadTooLarge,
                    format!(
                        "value of {} bytes exceeds limit of {}",
                        value.len(),
                        self.config.max_value_bytes
                    ),
                ));
            }
        }
        None
    }

    /// Executes `operation` under its concurrency key, replicates it, and returns the
    /// client response.
    pub async fn apply(&self, operation: MapOperation) -> Result<MapResponse, EntityError> {
        self.check_healthy()?;
        if let Some(rejection) = self.check_limits(&operation) {
            self.core.stats.record_rejected();
            return Ok(rejection);
        }

        let key = self.core.strategy.concurrency_key(&operation);
        let mut guard = self
            .core
            .lanes
            .acquire(key)
            .await
            .map_err(|e| self.poison_on_fatal(e))?;

        let state = guard.state_mut();
        state.sequence += 1;
        let sequence = state.sequence;

        let response = self.core.store.execute(&operation);
        self.core.stats.record(&operation);
        tracing::trace!(parent: &self.span, %key, sequence, kind = operation.kind(), "applied");

        let message = ReplicatedOperation {
            key,
            sequence,
            operation,
        };
        let pending = self.fan_out(&message);
        drop(guard);

        self.await_acks(pending).await;
        Ok(response)
    }

    /// Queues `message` for every passive that should see it. Called with the lane
    /// held, so queue order matches commit order.
    fn fan_out(&self, message: &ReplicatedOperation) -> Vec<PendingAck> {
        let want_ack = self.config.ack_policy == AckPolicy::ReplicateThenAck;
        self.passives
            .iter()
            .filter_map(|entry| entry.value().offer(message, want_ack))
            .collect()
    }

    async fn await_acks(&self, pending: Vec<PendingAck>) {
        if pending.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.config.replication_timeout();
        for PendingAck { handle, epoch, ack } in pending {
            match tokio::time::timeout_at(deadline, ack).await {
                Ok(Ok(true)) => {}
                Ok(_) => {
                    handle.mark_lagging(epoch);
                }
                Err(_) => {
                    tracing::warn!(
                        parent: &self.span,
                        passive = %handle.id().0,
                        "replication ack timed out"
                    );
                    handle.mark_lagging(epoch);
                }
            }
        }
    }

    /// Every entry currently in `key`'s shard, taken while holding the lane so no
    /// operation on that key is admitted mid-snapshot.
    pub async fn snapshot(&self, key: ConcurrencyKey) -> Result<ShardSnapshot, EntityError> {
        let guard = self
            .core
            .lanes
            .acquire(key)
            .await
            .map_err(|e| self.poison_on_fatal(e))?;
        Ok(self.snapshot_locked(key, guard.state().sequence))
    }

    fn snapshot_locked(&self, key: ConcurrencyKey, sequence: u64) -> ShardSnapshot {
        let entries = match key.shard() {
            Some(shard) => self.core.store.snapshot(shard),
            None => Vec::new(),
        };
        ShardSnapshot {
            key,
            sequence,
            entries,
        }
    }

    /// Attaches a passive and schedules its initial reconciliation.
    pub fn attach_passive(&self, link: Arc<dyn PassiveLink>) -> PassiveId {
        let id = PassiveId::new();
        let handle = PassiveHandle::spawn(
            id.clone(),
            link,
            self.lagging_tx.clone(),
            self.span.clone(),
        );
        self.passives.insert(id.clone(), handle);
        tracing::info!(parent: &self.span, passive = %id.0, "passive attached");
        let _ = self.lagging_tx.send(id.clone());
        id
    }

    pub fn detach_passive(&self, id: &PassiveId) -> bool {
        match self.passives.remove(id) {
            Some((_, handle)) => {
                handle.retire();
                tracing::info!(parent: &self.span, passive = %id.0, "passive detached");
                true
            }
            None => false,
        }
    }

    pub fn passive_status(&self, id: &PassiveId) -> Option<PassiveStatus> {
        self.passives.get(id).map(|handle| handle.status())
    }

    /// Every attached passive with its current status.
    pub fn passives(&self) -> Vec<(PassiveId, PassiveStatus)> {
        self.passives
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect()
    }

    /// Brings one passive up to date, lane by lane, universal key first.
    async fn reconcile(&self, handle: Arc<PassiveHandle>) {
        let attempt = handle.next_attempt();
        if attempt > self.config.reconcile_attempts {
            tracing::error!(
                passive = %handle.id().0,
                "giving up reconciliation after {} attempts",
                self.config.reconcile_attempts
            );
            return;
        }
        if attempt > 1 {
            // Same backoff shape as the HTTP retries: doubling from 150ms, capped, jittered.
            let delay_ms = (150u64 << (attempt - 2).min(3)).min(1200);
            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
        }

        let Some(epoch) = handle.begin_reconcile() else {
            return;
        };
        tracing::info!(passive = %handle.id().0, attempt, "reconciling passive");

        for key in self.core.strategy.all_keys() {
            if let Err(e) = self.transfer_key(&handle, epoch, key).await {
                tracing::warn!(passive = %handle.id().0, %key, "reconciliation failed: {}", e);
                handle.mark_lagging(epoch);
                return;
            }
        }

        if handle.finish_reconcile(epoch) {
            tracing::info!(passive = %handle.id().0, "passive in sync");
        }
    }

    async fn transfer_key(
        &self,
        handle: &PassiveHandle,
        epoch: u64,
        key: ConcurrencyKey,
    ) -> anyhow::Result<()> {
        let guard = self
            .core
            .lanes
            .acquire(key)
            .await
            .map_err(|e| self.poison_on_fatal(e))?;
        let snapshot = self.snapshot_locked(key, guard.state().sequence);
        if !handle.mark_synced(epoch, key) {
            anyhow::bail!("epoch {} superseded", epoch);
        }

        // The first frame opens the transfer on the passive and must precede any later
        // operation on this key; the rest may interleave, the passive buffers them.
        let transfer = rand::random::<u64>();
        let mut frames = self.sync_codec.frames(&snapshot);
        let mut ack = None;
        let mut count = 0u32;
        if let Some(first) = frames.next() {
            ack = Some(handle.enqueue_sync(epoch, SyncPosition::new(transfer, count), first?));
            count += 1;
        }
        drop(guard);

        for frame in frames {
            ack = Some(handle.enqueue_sync(epoch, SyncPosition::new(transfer, count), frame?));
            count += 1;
        }

        let Some(ack) = ack else {
            return Ok(());
        };
        let timeout = self.config.replication_timeout().saturating_mul(count);
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(true)) => {
                tracing::debug!(%key, entries = snapshot.entries.len(), frames = count, "lane transferred");
                Ok(())
            }
            Ok(_) => anyhow::bail!("transfer of {} not acknowledged", key),
            Err(_) => anyhow::bail!("transfer of {} timed out", key),
        }
    }

    pub fn get_local(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.core.store.get(key)
    }

    pub fn len(&self) -> usize {
        self.core.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.store.is_empty()
    }

    /// Named counters for the management layer.
    pub fn statistics(&self) -> BTreeMap<String, u64> {
        let mut stats = self.core.statistics();
        let (mut synced, mut reconciling, mut lagging) = (0u64, 0u64, 0u64);
        for handle in self.passives.iter() {
            match handle.value().status() {
                PassiveStatus::Synced => synced += 1,
                PassiveStatus::Reconciling(_) => reconciling += 1,
                PassiveStatus::Lagging => lagging += 1,
                PassiveStatus::Retired => {}
            }
        }
        stats.insert("passives.synced".to_string(), synced);
        stats.insert("passives.reconciling".to_string(), reconciling);
        stats.insert("passives.lagging".to_string(), lagging);
        stats
    }

    pub fn query_statistics(&self, names: &[&str]) -> BTreeMap<String, u64> {
        stats::select(self.statistics(), names)
    }
}

/// Starts one reconciliation per lagging notification, for as long as the entity lives.
async fn supervise(entity: Weak<ActiveMapEntity>, mut lagging_rx: mpsc::UnboundedReceiver<PassiveId>) {
    while let Some(id) = lagging_rx.recv().await {
        let Some(entity) = entity.upgrade() else {
            break;
        };
        let Some(handle) = entity.passives.get(&id).map(|h| h.value().clone()) else {
            continue;
        };
        let span = entity.span.clone();
        tokio::spawn(
            async move {
                entity.reconcile(handle).await;
            }
            .instrument(span),
        );
    }
}
