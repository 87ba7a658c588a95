//! Ordering lanes.
//!
//! One FIFO mutex per shard plus one for the universal key, all behind a shared
//! barrier:
//!
//! - a key-scoped operation holds the barrier *shared* and its shard mutex, so
//!   different shards run in parallel while one shard runs strictly in arrival order;
//! - a universal operation holds the barrier *exclusively*, which waits for every
//!   in-flight shard operation to drain and holds back new ones until it finishes.
//!
//! Tokio's mutex and rwlock both grant access in request order, which is what makes
//! the per-lane order FIFO.

use crate::error::EntityError;
use crate::strategy::concurrency::ConcurrencyKey;

use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct OrderedLanes<T> {
    barrier: RwLock<()>,
    shards: Vec<Mutex<T>>,
    universal: Mutex<T>,
    barrier_timeout: Duration,
}

// The guards are only held, never read: dropping them releases the barrier.
#[allow(dead_code)]
enum BarrierGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

/// Exclusive access to one lane's state. Dropping it lets the next operation in.
pub struct LaneGuard<'a, T> {
    key: ConcurrencyKey,
    lanes: &'a OrderedLanes<T>,
    state: MutexGuard<'a, T>,
    // Declared last so the lane is released before the barrier.
    barrier: BarrierGuard<'a>,
}

impl<T: Default> OrderedLanes<T> {
    pub fn new(shard_count: u32, barrier_timeout: Duration) -> Self {
        Self {
            barrier: RwLock::new(()),
            shards: (0..shard_count).map(|_| Mutex::new(T::default())).collect(),
            universal: Mutex::new(T::default()),
            barrier_timeout,
        }
    }
}

impl<T> OrderedLanes<T> {
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub async fn acquire(&self, key: ConcurrencyKey) -> Result<LaneGuard<'_, T>, EntityError> {
        match key.shard() {
            Some(shard) => {
                let lane = self
                    .shards
                    .get(shard as usize)
                    .ok_or(EntityError::UnknownKey { key })?;
                let barrier = self.barrier.read().await;
                let state = lane.lock().await;
                Ok(LaneGuard {
                    key,
                    lanes: self,
                    state,
                    barrier: BarrierGuard::Shared(barrier),
                })
            }
            None => self.acquire_universal().await,
        }
    }

    /// Takes the barrier exclusively. Failing to get it in time means some lane is
    /// stuck, which no retry can fix.
    pub async fn acquire_universal(&self) -> Result<LaneGuard<'_, T>, EntityError> {
        let barrier = tokio::time::timeout(self.barrier_timeout, self.barrier.write())
            .await
            .map_err(|_| EntityError::BarrierTimeout {
                waited_ms: self.barrier_timeout.as_millis() as u64,
            })?;
        let state = self.universal.lock().await;
        Ok(LaneGuard {
            key: ConcurrencyKey::UNIVERSAL,
            lanes: self,
            state,
            barrier: BarrierGuard::Exclusive(barrier),
        })
    }
}

impl<'a, T> LaneGuard<'a, T> {
    pub fn key(&self) -> ConcurrencyKey {
        self.key
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut T {
        &mut self.state
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.barrier, BarrierGuard::Exclusive(_))
    }

    /// Locks every shard lane, in shard order. Only an exclusive guard may do this;
    /// a shard guard gets an empty list instead of deadlocking on its own lane.
    pub async fn lock_shards(&self) -> Vec<MutexGuard<'a, T>> {
        if !self.is_exclusive() {
            return Vec::new();
        }
        let mut guards = Vec::with_capacity(self.lanes.shards.len());
        for lane in &self.lanes.shards {
            guards.push(lane.lock().await);
        }
        guards
    }
}
