//! Replication fan-out from the active to its passives.
//!
//! Every attached passive gets a [`PassiveHandle`]: a FIFO queue drained by one
//! delivery task, so messages reach the passive in exactly the order the active
//! enqueued them (and the active enqueues while holding the lane).
//!
//! ## Status and epochs
//! - `Synced`: receives everything; counted in the replicate-then-ack wait set.
//! - `Reconciling`: receives operations only for keys whose snapshot was already
//!   queued; never waited on.
//! - `Lagging`: receives nothing until a reconciliation starts.
//! - `Retired`: detached; receives nothing and is never reconciled again.
//!
//! Any delivery failure bumps the handle's epoch. Queued messages from an older epoch
//! are dropped instead of sent, and the supervisor is told to reconcile the passive.

use super::passive::PassiveMapEntity;
use crate::map::types::MapOperation;
use crate::strategy::concurrency::ConcurrencyKey;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PassiveId(pub String);

impl PassiveId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PassiveId {
    fn default() -> Self {
        Self::new()
    }
}

/// An operation as committed by the active, ready to be replayed on a passive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedOperation {
    pub key: ConcurrencyKey,
    /// Position of the operation within its lane on the active.
    pub sequence: u64,
    pub operation: MapOperation,
}

/// Where a reconciliation frame sits in its transfer.
///
/// Every shard transfer gets a fresh `transfer` id and numbers its frames from 0, so a
/// passive can tell a new transfer from leftovers of an abandoned one, and a resent
/// frame from the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPosition {
    pub transfer: u64,
    pub index: u32,
}

impl SyncPosition {
    pub fn new(transfer: u64, index: u32) -> Self {
        Self { transfer, index }
    }
}

/// Transport from the active to one passive. The host framework owns the real
/// network; the active only needs ordered, acknowledged delivery.
#[async_trait]
pub trait PassiveLink: Send + Sync {
    async fn replicate(&self, message: &ReplicatedOperation) -> Result<()>;

    /// Delivers one reconciliation frame.
    async fn sync(&self, position: SyncPosition, frame: &[u8]) -> Result<()>;
}

/// Link to a passive living in the same process.
pub struct LocalPassiveLink {
    passive: Arc<PassiveMapEntity>,
}

impl LocalPassiveLink {
    pub fn new(passive: Arc<PassiveMapEntity>) -> Arc<Self> {
        Arc::new(Self { passive })
    }
}

#[async_trait]
impl PassiveLink for LocalPassiveLink {
    async fn replicate(&self, message: &ReplicatedOperation) -> Result<()> {
        self.passive.replay(message.clone()).await?;
        Ok(())
    }

    async fn sync(&self, position: SyncPosition, frame: &[u8]) -> Result<()> {
        self.passive.sync_frame(position, frame).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassiveStatus {
    Synced,
    /// Keys whose snapshot has been queued during the current reconciliation.
    Reconciling(HashSet<ConcurrencyKey>),
    Lagging,
    Retired,
}

pub(crate) enum Outbound {
    Replicate(ReplicatedOperation),
    Sync(SyncPosition, Vec<u8>),
}

struct Envelope {
    epoch: u64,
    message: Outbound,
    ack: Option<oneshot::Sender<bool>>,
}

/// A queued message whose delivery the caller wants to wait for.
pub(crate) struct PendingAck {
    pub handle: Arc<PassiveHandle>,
    pub epoch: u64,
    pub ack: oneshot::Receiver<bool>,
}

pub struct PassiveHandle {
    id: PassiveId,
    status: Mutex<PassiveStatus>,
    epoch: AtomicU64,
    attempts: AtomicU32,
    outbound: mpsc::UnboundedSender<Envelope>,
    lagging: mpsc::UnboundedSender<PassiveId>,
}

impl PassiveHandle {
    /// Creates the handle in `Lagging` state and starts its delivery task. The caller
    /// is expected to schedule a reconciliation.
    pub(crate) fn spawn(
        id: PassiveId,
        link: Arc<dyn PassiveLink>,
        lagging: mpsc::UnboundedSender<PassiveId>,
        span: tracing::Span,
    ) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id,
            status: Mutex::new(PassiveStatus::Lagging),
            epoch: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
            outbound,
            lagging,
        });
        tokio::spawn(delivery_loop(Arc::downgrade(&handle), link, rx).instrument(span));
        handle
    }

    pub fn id(&self) -> &PassiveId {
        &self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PassiveStatus {
        self.lock_status().clone()
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, PassiveStatus> {
        // Status updates never panic midway, so a poisoned lock still holds a valid value.
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `message` if the passive should see operations on `key` right now.
    ///
    /// With `want_ack` and a fully synced passive, returns a receiver that resolves
    /// once the passive applied the message.
    pub(crate) fn offer(
        self: &Arc<Self>,
        message: &ReplicatedOperation,
        want_ack: bool,
    ) -> Option<PendingAck> {
        let status = self.lock_status();
        let (forward, in_sync) = match &*status {
            PassiveStatus::Synced => (true, true),
            PassiveStatus::Reconciling(synced) => (synced.contains(&message.key), false),
            PassiveStatus::Lagging | PassiveStatus::Retired => (false, false),
        };
        if !forward {
            return None;
        }

        let epoch = self.epoch();
        let (ack_tx, ack_rx) = if want_ack && in_sync {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let envelope = Envelope {
            epoch,
            message: Outbound::Replicate(message.clone()),
            ack: ack_tx,
        };
        if self.outbound.send(envelope).is_err() {
            return None;
        }
        ack_rx.map(|ack| PendingAck {
            handle: self.clone(),
            epoch,
            ack,
        })
    }

    /// Queues one reconciliation frame under `epoch`.
    pub(crate) fn enqueue_sync(
        &self,
        epoch: u64,
        position: SyncPosition,
        frame: Vec<u8>,
    ) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let envelope = Envelope {
            epoch,
            message: Outbound::Sync(position, frame),
            ack: Some(tx),
        };
        // A closed queue drops the envelope, and with it the sender; the receiver
        // then reports failure.
        let _ = self.outbound.send(envelope);
        rx
    }

    /// Marks the passive lagging if `epoch` is still current. Returns whether this call
    /// made the transition; only that caller notifies the supervisor.
    pub fn mark_lagging(&self, epoch: u64) -> bool {
        let mut status = self.lock_status();
        if *status == PassiveStatus::Retired
            || self
                .epoch
                .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return false;
        }
        *status = PassiveStatus::Lagging;
        drop(status);

        tracing::warn!(passive = %self.id.0, epoch, "passive marked lagging");
        let _ = self.lagging.send(self.id.clone());
        true
    }

    /// Stops all traffic to the passive for good. A reconciliation already scheduled
    /// finds the handle retired and does nothing.
    pub(crate) fn retire(&self) {
        let mut status = self.lock_status();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *status = PassiveStatus::Retired;
    }

    /// Moves a lagging passive into reconciliation. Returns the epoch the transfer runs
    /// under, or `None` if the passive is not lagging (another transfer owns it).
    pub(crate) fn begin_reconcile(&self) -> Option<u64> {
        let mut status = self.lock_status();
        if *status != PassiveStatus::Lagging {
            return None;
        }
        *status = PassiveStatus::Reconciling(HashSet::new());
        Some(self.epoch())
    }

    /// Records that the snapshot for `key` is being queued. Must be called while
    /// holding the key's lane.
    pub(crate) fn mark_synced(&self, epoch: u64, key: ConcurrencyKey) -> bool {
        let mut status = self.lock_status();
        if self.epoch() != epoch {
            return false;
        }
        match &mut *status {
            PassiveStatus::Reconciling(synced) => {
                synced.insert(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn finish_reconcile(&self, epoch: u64) -> bool {
        let mut status = self.lock_status();
        if self.epoch() != epoch || !matches!(*status, PassiveStatus::Reconciling(_)) {
            return false;
        }
        *status = PassiveStatus::Synced;
        self.attempts.store(0, Ordering::SeqCst);
        true
    }

    /// Counts a reconciliation attempt and returns the running total.
    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }
}

async fn delivery_loop(
    handle: Weak<PassiveHandle>,
    link: Arc<dyn PassiveLink>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let Some(handle) = handle.upgrade() else {
            break;
        };

        let delivered = if envelope.epoch != handle.epoch() {
            tracing::trace!(passive = %handle.id.0, "dropping message from stale epoch");
            false
        } else {
            let result = match &envelope.message {
                Outbound::Replicate(message) => link.replicate(message).await,
                Outbound::Sync(position, frame) => link.sync(*position, frame).await,
            };
            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(passive = %handle.id.0, "delivery failed: {}", e);
                    handle.mark_lagging(envelope.epoch);
                    false
                }
            }
        };

        if let Some(ack) = envelope.ack {
            let _ = ack.send(delivered);
        }
    }
    tracing::debug!("delivery loop stopped");
}
