//! Passive map entity: mirrors the active's operations and can take over from it.

use super::active::ActiveMapEntity;
use super::lanes::LaneGuard;
use super::replication::{PassiveLink, ReplicatedOperation, SyncPosition};
use super::state::{LaneState, MapCore, PendingSync, SyncState};
use super::stats;
use crate::codec::error::CodecError;
use crate::codec::sync::{ReconciliationCodec, ShardSnapshot};
use crate::config::MapConfig;
use crate::error::EntityError;
use crate::map::types::{Entry, MapOperation};
use crate::strategy::concurrency::{ConcurrencyKey, MapConcurrencyStrategy};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct PassiveMapEntity {
    core: Arc<MapCore>,
    config: MapConfig,
    sync_codec: ReconciliationCodec,
    promoted: AtomicBool,
    span: tracing::Span,
}

impl PassiveMapEntity {
    pub fn new(config: MapConfig) -> Result<Self, EntityError> {
        config.validate()?;
        let span = tracing::info_span!("clustered_map", entity = %config.entity_name, role = "passive");
        Ok(Self {
            core: Arc::new(MapCore::new(&config)),
            sync_codec: ReconciliationCodec::new(config.sync_chunk_entries, config.sync_chunk_bytes),
            config,
            promoted: AtomicBool::new(false),
            span,
        })
    }

    pub fn strategy(&self) -> &MapConcurrencyStrategy {
        &self.core.strategy
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted.load(Ordering::SeqCst)
    }

    async fn lane(&self, key: ConcurrencyKey) -> Result<LaneGuard<'_, LaneState>, EntityError> {
        let guard = self.core.lanes.acquire(key).await?;
        if self.is_promoted() {
            return Err(EntityError::NotPassive);
        }
        Ok(guard)
    }

    /// Applies one operation forwarded by the active, in the order the active
    /// committed it. Nothing is sent back to a client.
    ///
    /// Duplicates (sequence already applied) are skipped; a skipped sequence number is
    /// an error so the active reconciles this passive.
    pub async fn replay(&self, message: ReplicatedOperation) -> Result<(), EntityError> {
        let expected = self.core.strategy.concurrency_key(&message.operation);
        if expected != message.key {
            return Err(EntityError::KeyMismatch {
                expected,
                received: message.key,
            });
        }

        let mut guard = self.lane(message.key).await?;
        if let SyncState::Syncing(pending) = &mut guard.state_mut().sync {
            tracing::trace!(parent: &self.span, key = %message.key, sequence = message.sequence, "buffered during sync");
            pending.buffered.push(message);
            return Ok(());
        }

        let last = guard.state().sequence;
        if message.sequence <= last {
            tracing::debug!(parent: &self.span, key = %message.key, sequence = message.sequence, last, "duplicate skipped");
            return Ok(());
        }
        if message.sequence != last + 1 {
            return Err(EntityError::SequenceGap {
                key: message.key,
                last,
                received: message.sequence,
            });
        }

        self.execute(&guard, &message).await;
        guard.state_mut().sequence = message.sequence;
        Ok(())
    }

    async fn execute(&self, guard: &LaneGuard<'_, LaneState>, message: &ReplicatedOperation) {
        match &message.operation {
            // A shard still receiving its snapshot must see the clear after the
            // snapshot lands, not before.
            MapOperation::Clear => {
                for (shard, mut lane) in guard.lock_shards().await.into_iter().enumerate() {
                    match &mut lane.sync {
                        SyncState::Syncing(pending) => pending.buffered.push(message.clone()),
                        SyncState::Current => self.core.store.clear_shard(shard as u32),
                    }
                }
            }
            operation => {
                self.core.store.execute(operation);
            }
        }
        self.core.stats.record(&message.operation);
    }

    /// Feeds one reconciliation frame at `position` of its transfer. The lane keeps its
    /// old contents until the end-of-shard marker arrives; a transfer that fails is
    /// thrown away whole.
    ///
    /// Frame 0 of a new transfer replaces whatever an abandoned transfer left staged.
    /// Frames already accepted, and frames of a transfer already committed, are
    /// skipped, so a resent frame is harmless.
    pub async fn sync_frame(
        &self,
        position: SyncPosition,
        bytes: &[u8],
    ) -> Result<(), EntityError> {
        let frame = match self.sync_codec.decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                let key = peek_key(bytes);
                if let Ok(mut guard) = self.lane(key).await
                    && let SyncState::Syncing(pending) = &guard.state().sync
                    && pending.transfer == position.transfer
                {
                    guard.state_mut().sync = SyncState::Current;
                }
                return Err(EntityError::IncompleteSync {
                    key,
                    reason: e.to_string(),
                });
            }
        };

        let key = frame.key();
        let mut guard = self.lane(key).await?;
        let state = guard.state_mut();
        if state.committed_transfer == Some(position.transfer) {
            tracing::debug!(parent: &self.span, %key, index = position.index, "frame of committed transfer skipped");
            return Ok(());
        }

        let opens_transfer = match &state.sync {
            SyncState::Syncing(pending) => pending.transfer != position.transfer,
            SyncState::Current => true,
        };
        if opens_transfer {
            if position.index != 0 {
                return Err(EntityError::IncompleteSync {
                    key,
                    reason: format!(
                        "frame {} of transfer {:016x} arrived without its opening frame",
                        position.index, position.transfer
                    ),
                });
            }
            match &state.sync {
                SyncState::Syncing(stale) => tracing::warn!(
                    parent: &self.span,
                    %key,
                    staged = stale.assembler.staged_len(),
                    "abandoned sync replaced by a new transfer"
                ),
                SyncState::Current => tracing::debug!(parent: &self.span, %key, "sync started"),
            }
            state.sync = SyncState::Syncing(PendingSync::new(key, position.transfer));
        }
        let SyncState::Syncing(pending) = &mut state.sync else {
            return Ok(());
        };

        if position.index < pending.next_index {
            tracing::debug!(parent: &self.span, %key, index = position.index, "resent frame skipped");
            return Ok(());
        }
        if position.index > pending.next_index {
            let expected = pending.next_index;
            state.sync = SyncState::Current;
            tracing::warn!(parent: &self.span, %key, expected, received = position.index, "sync discarded: frame missing");
            return Err(EntityError::IncompleteSync {
                key,
                reason: format!("frame {} arrived, expected {}", position.index, expected),
            });
        }
        pending.next_index += 1;

        let snapshot = match pending.assembler.accept(frame) {
            Ok(None) => return Ok(()),
            Ok(Some(snapshot)) => snapshot,
            Err(e) => {
                state.sync = SyncState::Current;
                tracing::warn!(parent: &self.span, %key, "sync discarded: {}", e);
                return Err(EntityError::IncompleteSync {
                    key,
                    reason: e.to_string(),
                });
            }
        };

        let buffered = match std::mem::take(&mut state.sync) {
            SyncState::Syncing(pending) => pending.buffered,
            SyncState::Current => Vec::new(),
        };
        state.committed_transfer = Some(position.transfer);
        self.commit(&mut guard, snapshot, buffered).await
    }

    async fn commit(
        &self,
        guard: &mut LaneGuard<'_, LaneState>,
        snapshot: ShardSnapshot,
        buffered: Vec<ReplicatedOperation>,
    ) -> Result<(), EntityError> {
        let key = snapshot.key;
        let entries = snapshot.entries.len();
        match key.shard() {
            Some(shard) => {
                self.core.store.replace_shard(shard, snapshot.entries);
                let mut sequence = snapshot.sequence;
                for message in &buffered {
                    if message.key.is_universal() {
                        // Only a clear is ever buffered from the universal lane.
                        self.core.store.clear_shard(shard);
                    } else if message.sequence > sequence {
                        self.core.store.execute(&message.operation);
                        self.core.stats.record(&message.operation);
                        sequence = message.sequence;
                    }
                }
                guard.state_mut().sequence = sequence;
            }
            None => {
                if !snapshot.entries.is_empty() {
                    return Err(EntityError::IncompleteSync {
                        key,
                        reason: format!("universal key carries {} entries", entries),
                    });
                }
                let mut sequence = snapshot.sequence;
                for message in &buffered {
                    if message.sequence > sequence {
                        self.execute(guard, message).await;
                        sequence = message.sequence;
                    }
                }
                guard.state_mut().sequence = sequence;
            }
        }

        tracing::debug!(
            parent: &self.span,
            %key,
            entries,
            replayed = buffered.len(),
            sequence = guard.state().sequence,
            "sync committed"
        );
        Ok(())
    }

    /// Replaces `snapshot.key`'s shard with the snapshot's entries, as one complete
    /// transfer.
    pub async fn reconcile(&self, snapshot: ShardSnapshot) -> Result<(), EntityError> {
        let key = snapshot.key;
        let transfer = rand::random::<u64>();
        for (index, frame) in self.sync_codec.frames(&snapshot).enumerate() {
            let frame = frame.map_err(|e: CodecError| EntityError::IncompleteSync {
                key,
                reason: e.to_string(),
            })?;
            self.sync_frame(SyncPosition::new(transfer, index as u32), &frame)
                .await?;
        }
        Ok(())
    }

    /// Turns this mirror into the active, attaching `links` as its passives.
    ///
    /// Every lane is drained first. Transfers still in flight cannot complete any more;
    /// their lanes keep the last committed contents.
    pub async fn promote(
        &self,
        links: Vec<Arc<dyn PassiveLink>>,
    ) -> Result<Arc<ActiveMapEntity>, EntityError> {
        if self.promoted.swap(true, Ordering::SeqCst) {
            return Err(EntityError::NotPassive);
        }

        {
            let mut universal = self.core.lanes.acquire_universal().await?;
            for (shard, mut lane) in universal.lock_shards().await.into_iter().enumerate() {
                if let SyncState::Syncing(pending) = std::mem::take(&mut lane.sync) {
                    tracing::warn!(
                        parent: &self.span,
                        shard,
                        staged = pending.assembler.staged_len(),
                        dropped = pending.buffered.len(),
                        "promoted with sync in flight"
                    );
                }
            }
            if let SyncState::Syncing(_) = std::mem::take(&mut universal.state_mut().sync) {
                tracing::warn!(parent: &self.span, "promoted with universal sync in flight");
            }
        }

        tracing::info!(parent: &self.span, entries = self.core.store.len(), "promoted to active");
        let active = ActiveMapEntity::from_core(self.core.clone(), self.config.clone());
        for link in links {
            active.attach_passive(link);
        }
        Ok(active)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.core.store.get(key)
    }

    /// Current contents of one shard, sorted by key.
    pub fn shard_entries(&self, key: ConcurrencyKey) -> Vec<Entry> {
        key.shard()
            .map(|shard| self.core.store.snapshot(shard))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.core.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.store.is_empty()
    }

    pub fn statistics(&self) -> BTreeMap<String, u64> {
        self.core.statistics()
    }

    pub fn query_statistics(&self, names: &[&str]) -> BTreeMap<String, u64> {
        stats::select(self.statistics(), names)
    }
}

fn peek_key(bytes: &[u8]) -> ConcurrencyKey {
    match bytes.get(..4) {
        Some(head) => ConcurrencyKey(u32::from_be_bytes([head[0], head[1], head[2], head[3]])),
        None => ConcurrencyKey::UNIVERSAL,
    }
}
