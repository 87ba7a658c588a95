//! Entity Module Tests
//!
//! ## Test Scopes
//! - **Active**: execution semantics, payload limits, raw request handling, fatal
//!   barrier failures.
//! - **Passive**: ordered replay, reconciliation with buffering, sequence checks,
//!   promotion.
//! - **Replication**: an active and in-process passives wired with `LocalPassiveLink`,
//!   including a link that can be switched off to force lagging and recovery.

#[cfg(test)]
mod tests {
    use crate::codec::operation::{OP_PUT, OperationCodec};
    use crate::codec::sync::{ReconciliationCodec, SyncFrame};
    use crate::config::{AckPolicy, MapConfig};
    use crate::entity::active::ActiveMapEntity;
    use crate::entity::lanes::OrderedLanes;
    use crate::entity::passive::PassiveMapEntity;
    use crate::entity::replication::{
        LocalPassiveLink, PassiveHandle, PassiveId, PassiveLink, PassiveStatus,
        ReplicatedOperation, SyncPosition,
    };
    use crate::error::EntityError;
    use crate::map::types::{Entry, ErrorKind, MapOperation, MapResponse};
    use crate::strategy::concurrency::ConcurrencyKey;

    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn config(shard_count: u32) -> MapConfig {
        MapConfig {
            entity_name: "test-map".to_string(),
            shard_count,
            reconcile_attempts: 20,
            ..MapConfig::default()
        }
    }

    fn put(key: &str, value: &str) -> MapOperation {
        MapOperation::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn get(key: &str) -> MapOperation {
        MapOperation::Get {
            key: key.as_bytes().to_vec(),
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Passes everything through to a local passive unless switched off.
    struct FailingLink {
        inner: Arc<LocalPassiveLink>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl PassiveLink for FailingLink {
        async fn replicate(&self, message: &ReplicatedOperation) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("link down");
            }
            self.inner.replicate(message).await
        }

        async fn sync(&self, position: SyncPosition, frame: &[u8]) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("link down");
            }
            self.inner.sync(position, frame).await
        }
    }

    // ============================================================
    // ACTIVE ENTITY
    // ============================================================

    #[tokio::test]
    async fn test_put_then_get_returns_value() {
        let active = ActiveMapEntity::new(config(8)).unwrap();

        let first = active.apply(put("k", "v")).await.unwrap();
        assert_eq!(first, MapResponse::Value(None));

        let read = active.apply(get("k")).await.unwrap();
        assert_eq!(read, MapResponse::Value(Some(b"v".to_vec())));

        let second = active.apply(put("k", "w")).await.unwrap();
        assert_eq!(second, MapResponse::Value(Some(b"v".to_vec())));
    }

    #[tokio::test]
    async fn test_size_and_clear() {
        let active = ActiveMapEntity::new(config(8)).unwrap();
        active.apply(put("k1", "a")).await.unwrap();
        active.apply(put("k2", "b")).await.unwrap();

        assert_eq!(
            active.apply(MapOperation::Size).await.unwrap(),
            MapResponse::Count(2)
        );
        assert_eq!(
            active.apply(MapOperation::Clear).await.unwrap(),
            MapResponse::Void
        );
        assert_eq!(
            active.apply(MapOperation::Size).await.unwrap(),
            MapResponse::Count(0)
        );
    }

    #[tokio::test]
    async fn test_conditional_operations() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        active.apply(put("k", "1")).await.unwrap();

        let missed = MapOperation::ConditionalReplace {
            key: b"k".to_vec(),
            old_value: b"0".to_vec(),
            new_value: b"2".to_vec(),
        };
        assert_eq!(active.apply(missed).await.unwrap(), MapResponse::Bool(false));

        let hit = MapOperation::ConditionalReplace {
            key: b"k".to_vec(),
            old_value: b"1".to_vec(),
            new_value: b"2".to_vec(),
        };
        assert_eq!(active.apply(hit).await.unwrap(), MapResponse::Bool(true));

        let absent = MapOperation::PutIfAbsent {
            key: b"k".to_vec(),
            value: b"3".to_vec(),
        };
        assert_eq!(
            active.apply(absent).await.unwrap(),
            MapResponse::Value(Some(b"2".to_vec()))
        );

        let remove = MapOperation::ConditionalRemove {
            key: b"k".to_vec(),
            value: b"2".to_vec(),
        };
        assert_eq!(active.apply(remove).await.unwrap(), MapResponse::Bool(true));
        assert_eq!(active.get_local(b"k"), None);
    }

    #[tokio::test]
    async fn test_oversized_value_rejected_without_mutation() {
        let mut cfg = config(4);
        cfg.max_value_bytes = 4;
        let active = ActiveMapEntity::new(cfg).unwrap();

        let response = active.apply(put("k", "too long")).await.unwrap();
        match response {
            MapResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::PayloadTooLarge),
            other => panic!("expected error response, got {:?}", other),
        }
        assert!(active.is_empty());

        let stats = active.statistics();
        assert_eq!(stats["requests.rejected"], 1);
        assert_eq!(stats["op.put"], 0);
    }

    #[tokio::test]
    async fn test_invoke_truncated_request_gets_error_response() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        let codec = OperationCodec::new();

        // Key length says 10 bytes, none follow.
        let bytes = active.invoke(&[OP_PUT, 0, 0, 0, 10]).await.unwrap();
        match codec.decode_response(&bytes).unwrap() {
            MapResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::MalformedRequest),
            other => panic!("expected error response, got {:?}", other),
        }
        assert!(!active.is_poisoned());
    }

    #[tokio::test]
    async fn test_invoke_unknown_opcode_is_protocol_failure() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        let result = active.invoke(&[0xEE, 1, 2, 3]).await;
        assert!(matches!(result, Err(EntityError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        let codec = OperationCodec::new();

        let request = codec.encode_operation(&put("k", "v")).unwrap();
        let response = codec
            .decode_response(&active.invoke(&request).await.unwrap())
            .unwrap();
        assert_eq!(response, MapResponse::Value(None));

        let request = codec.encode_operation(&MapOperation::Size).unwrap();
        let response = codec
            .decode_response(&active.invoke(&request).await.unwrap())
            .unwrap();
        assert_eq!(response, MapResponse::Count(1));
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_and_sequenced() {
        let active = ActiveMapEntity::new(config(1)).unwrap();
        active.apply(put("b", "2")).await.unwrap();
        active.apply(put("a", "1")).await.unwrap();
        active.apply(get("a")).await.unwrap();

        let snapshot = active.snapshot(ConcurrencyKey(0)).await.unwrap();
        assert_eq!(snapshot.sequence, 3);
        assert_eq!(
            snapshot.entries,
            vec![Entry::new("a", "1"), Entry::new("b", "2")]
        );

        let universal = active.snapshot(ConcurrencyKey::UNIVERSAL).await.unwrap();
        assert!(universal.entries.is_empty());
        assert_eq!(universal.sequence, 0);

        let outside = active.snapshot(ConcurrencyKey(5)).await;
        assert!(matches!(outside, Err(EntityError::UnknownKey { .. })));
    }

    #[tokio::test]
    async fn test_barrier_timeout_poisons_entity() {
        let mut cfg = config(2);
        cfg.barrier_timeout_ms = 50;
        let active = ActiveMapEntity::new(cfg).unwrap();

        let held = active.core().lanes.acquire(ConcurrencyKey(0)).await.unwrap();
        let result = active.apply(MapOperation::Clear).await;
        assert!(matches!(result, Err(EntityError::BarrierTimeout { .. })));
        drop(held);

        assert!(active.is_poisoned());
        assert_eq!(active.apply(get("k")).await, Err(EntityError::Poisoned));
    }

    #[tokio::test]
    async fn test_statistics_query() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        active.apply(put("a", "1")).await.unwrap();
        active.apply(put("b", "2")).await.unwrap();
        active.apply(get("a")).await.unwrap();

        let stats = active.query_statistics(&["op.put", "op.get", "entry_count", "nope"]);
        assert_eq!(stats.len(), 3);
        assert_eq!(stats["op.put"], 2);
        assert_eq!(stats["op.get"], 1);
        assert_eq!(stats["entry_count"], 2);

        let all = active.statistics();
        assert_eq!(all["shard_count"], 4);
        let per_shard: u64 = (0..4).map(|s| all[&format!("shard.{}.size", s)]).sum();
        assert_eq!(per_shard, 2);
    }

    // ============================================================
    // ORDERING LANES
    // ============================================================

    #[tokio::test]
    async fn test_universal_waits_for_shard_lanes() {
        let lanes: Arc<OrderedLanes<u64>> =
            Arc::new(OrderedLanes::new(4, Duration::from_secs(5)));
        let shard = lanes.acquire(ConcurrencyKey(1)).await.unwrap();

        let waiter = {
            let lanes = lanes.clone();
            tokio::spawn(async move {
                let guard = lanes.acquire_universal().await.unwrap();
                guard.is_exclusive()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "universal lane admitted during shard op");

        drop(shard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_distinct_shards_run_in_parallel() {
        let lanes: OrderedLanes<u64> = OrderedLanes::new(4, Duration::from_secs(5));
        let mut a = lanes.acquire(ConcurrencyKey(0)).await.unwrap();
        let mut b = lanes.acquire(ConcurrencyKey(1)).await.unwrap();
        *a.state_mut() += 1;
        *b.state_mut() += 2;
        assert!(a.lock_shards().await.is_empty());
        assert_eq!((*a.state(), *b.state()), (1, 2));
    }

    #[tokio::test]
    async fn test_shard_lane_waits_for_universal() {
        let lanes: Arc<OrderedLanes<u64>> =
            Arc::new(OrderedLanes::new(4, Duration::from_secs(5)));
        let universal = lanes.acquire_universal().await.unwrap();

        let waiter = {
            let lanes = lanes.clone();
            tokio::spawn(async move {
                let guard = lanes.acquire(ConcurrencyKey(2)).await.unwrap();
                guard.is_exclusive()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "shard lane admitted during universal op");

        drop(universal);
        assert!(!waiter.await.unwrap());
    }

    // ============================================================
    // PASSIVE ENTITY
    // ============================================================

    #[tokio::test]
    async fn test_reconcile_then_replayed_remove_empties_shard() {
        let passive = PassiveMapEntity::new(config(1)).unwrap();
        let snapshot = crate::codec::sync::ShardSnapshot {
            key: ConcurrencyKey(0),
            sequence: 1,
            entries: vec![Entry::new("a", "1")],
        };
        passive.reconcile(snapshot).await.unwrap();
        assert_eq!(passive.get(b"a"), Some(b"1".to_vec()));

        passive
            .replay(ReplicatedOperation {
                key: ConcurrencyKey(0),
                sequence: 2,
                operation: MapOperation::Remove { key: b"a".to_vec() },
            })
            .await
            .unwrap();
        assert!(passive.shard_entries(ConcurrencyKey(0)).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reconcile_replay_matches_active() {
        let active = ActiveMapEntity::new(config(2)).unwrap();
        for i in 0..20 {
            active.apply(put(&format!("k{}", i), "x")).await.unwrap();
        }

        let passive = PassiveMapEntity::new(config(2)).unwrap();
        let key = ConcurrencyKey(1);
        let snapshot = active.snapshot(key).await.unwrap();
        let mut sequence = snapshot.sequence;
        passive.reconcile(snapshot).await.unwrap();

        for i in 0..20 {
            let operation = if i % 3 == 0 {
                MapOperation::Remove {
                    key: format!("k{}", i).into_bytes(),
                }
            } else {
                put(&format!("k{}", i), "y")
            };
            if active.strategy().concurrency_key(&operation) != key {
                continue;
            }
            active.apply(operation.clone()).await.unwrap();
            sequence += 1;
            passive
                .replay(ReplicatedOperation {
                    key,
                    sequence,
                    operation,
                })
                .await
                .unwrap();
        }

        let current = active.snapshot(key).await.unwrap();
        assert_eq!(passive.shard_entries(key), current.entries);
    }

    #[tokio::test]
    async fn test_replay_buffers_until_end_of_shard() {
        let passive = PassiveMapEntity::new(config(1)).unwrap();
        let codec = ReconciliationCodec::new(512, 1 << 20);
        let key = ConcurrencyKey(0);

        let first = SyncFrame::Entries {
            key,
            entries: vec![Entry::new("a", "1")],
        };
        passive
            .sync_frame(SyncPosition::new(1, 0), &codec.encode_frame(&first).unwrap())
            .await
            .unwrap();

        passive
            .replay(ReplicatedOperation {
                key,
                sequence: 6,
                operation: put("b", "2"),
            })
            .await
            .unwrap();
        assert_eq!(passive.get(b"a"), None);
        assert_eq!(passive.get(b"b"), None);

        let end = SyncFrame::End {
            key,
            sequence: 5,
            total: 1,
        };
        passive
            .sync_frame(SyncPosition::new(1, 1), &codec.encode_frame(&end).unwrap())
            .await
            .unwrap();
        assert_eq!(passive.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(passive.get(b"b"), Some(b"2".to_vec()));

        // Lane continues from the buffered operation's sequence.
        let next = ReplicatedOperation {
            key,
            sequence: 7,
            operation: put("c", "3"),
        };
        passive.replay(next).await.unwrap();
        assert_eq!(passive.len(), 3);
    }

    #[tokio::test]
    async fn test_clear_during_sync_applies_after_snapshot() {
        let passive = PassiveMapEntity::new(config(2)).unwrap();
        let codec = ReconciliationCodec::new(512, 1 << 20);
        let key = ConcurrencyKey(0);

        let first = SyncFrame::Entries {
            key,
            entries: vec![Entry::new("a", "1")],
        };
        passive
            .sync_frame(SyncPosition::new(1, 0), &codec.encode_frame(&first).unwrap())
            .await
            .unwrap();
        passive
            .replay(ReplicatedOperation {
                key: ConcurrencyKey::UNIVERSAL,
                sequence: 1,
                operation: MapOperation::Clear,
            })
            .await
            .unwrap();

        let end = SyncFrame::End {
            key,
            sequence: 3,
            total: 1,
        };
        passive
            .sync_frame(SyncPosition::new(1, 1), &codec.encode_frame(&end).unwrap())
            .await
            .unwrap();
        assert!(passive.shard_entries(key).is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_sync_is_discarded() {
        let passive = PassiveMapEntity::new(config(1)).unwrap();
        let codec = ReconciliationCodec::new(512, 1 << 20);
        let key = ConcurrencyKey(0);
        passive
            .replay(ReplicatedOperation {
                key,
                sequence: 1,
                operation: put("old", "0"),
            })
            .await
            .unwrap();

        let partial = SyncFrame::Entries {
            key,
            entries: vec![Entry::new("a", "1"), Entry::new("b", "2")],
        };
        passive
            .sync_frame(SyncPosition::new(1, 0), &codec.encode_frame(&partial).unwrap())
            .await
            .unwrap();
        // Claims three entries; one frame never arrived.
        let end = SyncFrame::End {
            key,
            sequence: 9,
            total: 3,
        };
        let result = passive
            .sync_frame(SyncPosition::new(1, 1), &codec.encode_frame(&end).unwrap())
            .await;
        assert!(matches!(result, Err(EntityError::IncompleteSync { .. })));

        // Previous contents survive and the lane accepts replays directly again.
        assert_eq!(passive.shard_entries(key), vec![Entry::new("old", "0")]);
        passive
            .replay(ReplicatedOperation {
                key,
                sequence: 2,
                operation: put("new", "1"),
            })
            .await
            .unwrap();
        assert_eq!(passive.get(b"new"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_fresh_transfer_replaces_abandoned_staging() {
        let passive = PassiveMapEntity::new(config(1)).unwrap();
        let codec = ReconciliationCodec::new(512, 1 << 20);
        let key = ConcurrencyKey(0);

        // A transfer that never got past its first frame.
        let abandoned = SyncFrame::Entries {
            key,
            entries: vec![Entry::new("a", "1")],
        };
        passive
            .sync_frame(SyncPosition::new(7, 0), &codec.encode_frame(&abandoned).unwrap())
            .await
            .unwrap();

        let snapshot = crate::codec::sync::ShardSnapshot {
            key,
            sequence: 3,
            entries: vec![Entry::new("a", "1")],
        };
        passive.reconcile(snapshot).await.unwrap();
        assert_eq!(passive.shard_entries(key), vec![Entry::new("a", "1")]);

        passive
            .replay(ReplicatedOperation {
                key,
                sequence: 4,
                operation: put("b", "2"),
            })
            .await
            .unwrap();
        assert_eq!(passive.len(), 2);
    }

    #[tokio::test]
    async fn test_resent_sync_frames_are_skipped() {
        let passive = PassiveMapEntity::new(config(1)).unwrap();
        let codec = ReconciliationCodec::new(512, 1 << 20);
        let key = ConcurrencyKey(0);
        let first = codec
            .encode_frame(&SyncFrame::Entries {
                key,
                entries: vec![Entry::new("a", "1"), Entry::new("b", "2")],
            })
            .unwrap();
        let end = codec
            .encode_frame(&SyncFrame::End {
                key,
                sequence: 2,
                total: 2,
            })
            .unwrap();

        passive.sync_frame(SyncPosition::new(5, 0), &first).await.unwrap();
        passive.sync_frame(SyncPosition::new(5, 0), &first).await.unwrap();
        passive.sync_frame(SyncPosition::new(5, 1), &end).await.unwrap();
        assert_eq!(passive.len(), 2);

        // Late copies of an already committed transfer change nothing.
        passive.sync_frame(SyncPosition::new(5, 1), &end).await.unwrap();
        passive.sync_frame(SyncPosition::new(5, 0), &first).await.unwrap();
        assert_eq!(passive.len(), 2);

        passive
            .replay(ReplicatedOperation {
                key,
                sequence: 3,
                operation: put("c", "3"),
            })
            .await
            .unwrap();
        assert_eq!(passive.get(b"c"), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn test_sync_frames_out_of_order_rejected() {
        let passive = PassiveMapEntity::new(config(1)).unwrap();
        let codec = ReconciliationCodec::new(512, 1 << 20);
        let key = ConcurrencyKey(0);
        let entries = codec
            .encode_frame(&SyncFrame::Entries {
                key,
                entries: vec![Entry::new("a", "1")],
            })
            .unwrap();
        let end = codec
            .encode_frame(&SyncFrame::End {
                key,
                sequence: 1,
                total: 1,
            })
            .unwrap();

        let orphan = passive.sync_frame(SyncPosition::new(3, 1), &end).await;
        assert!(matches!(orphan, Err(EntityError::IncompleteSync { .. })));

        passive.sync_frame(SyncPosition::new(4, 0), &entries).await.unwrap();
        let skipped = passive.sync_frame(SyncPosition::new(4, 2), &end).await;
        assert!(matches!(skipped, Err(EntityError::IncompleteSync { .. })));
        assert!(passive.is_empty());

        // The discarded transfer no longer holds replays back.
        passive
            .replay(ReplicatedOperation {
                key,
                sequence: 1,
                operation: put("k", "v"),
            })
            .await
            .unwrap();
        assert_eq!(passive.get(b"k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_replay_skips_duplicates_and_rejects_gaps() {
        let passive = PassiveMapEntity::new(config(1)).unwrap();
        let key = ConcurrencyKey(0);
        let message = |sequence, value: &str| ReplicatedOperation {
            key,
            sequence,
            operation: put("k", value),
        };

        passive.replay(message(1, "a")).await.unwrap();
        passive.replay(message(1, "b")).await.unwrap();
        assert_eq!(passive.get(b"k"), Some(b"a".to_vec()));

        let gap = passive.replay(message(3, "c")).await;
        assert_eq!(
            gap,
            Err(EntityError::SequenceGap {
                key,
                last: 1,
                received: 3
            })
        );
    }

    #[tokio::test]
    async fn test_replay_with_wrong_key_rejected() {
        let passive = PassiveMapEntity::new(config(4)).unwrap();
        let operation = put("k", "v");
        let expected = passive.strategy().concurrency_key(&operation);
        let wrong = ConcurrencyKey((expected.0 + 1) % 4);

        let result = passive
            .replay(ReplicatedOperation {
                key: wrong,
                sequence: 1,
                operation,
            })
            .await;
        assert_eq!(
            result,
            Err(EntityError::KeyMismatch {
                expected,
                received: wrong
            })
        );
        assert!(passive.is_empty());
    }

    // ============================================================
    // REPLICATION
    // ============================================================

    #[tokio::test]
    async fn test_attached_passive_mirrors_acknowledged_writes() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        active.apply(put("before", "1")).await.unwrap();

        let passive = Arc::new(PassiveMapEntity::new(config(4)).unwrap());
        let id = active.attach_passive(LocalPassiveLink::new(passive.clone()));
        wait_until("initial sync", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;
        assert_eq!(passive.get(b"before"), Some(b"1".to_vec()));

        // Replicate-then-ack: visible on the passive once apply returns.
        active.apply(put("after", "2")).await.unwrap();
        assert_eq!(passive.get(b"after"), Some(b"2".to_vec()));

        active.apply(MapOperation::Clear).await.unwrap();
        assert!(passive.is_empty());

        assert_eq!(active.statistics()["passives.synced"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_per_key_order() {
        let active = ActiveMapEntity::new(config(8)).unwrap();
        let passive = Arc::new(PassiveMapEntity::new(config(8)).unwrap());
        let id = active.attach_passive(LocalPassiveLink::new(passive.clone()));
        wait_until("initial sync", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;

        let mut writers = Vec::new();
        for writer in 0..4 {
            let active = active.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = format!("w{}", writer);
                    active.apply(put(&key, &i.to_string())).await.unwrap();
                    if i % 10 == 0 {
                        active.apply(MapOperation::Size).await.unwrap();
                    }
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        for writer in 0..4 {
            let key = format!("w{}", writer);
            assert_eq!(active.get_local(key.as_bytes()), Some(b"49".to_vec()));
            assert_eq!(passive.get(key.as_bytes()), Some(b"49".to_vec()));
        }
        for key in active.strategy().all_keys() {
            let snapshot = active.snapshot(key).await.unwrap();
            assert_eq!(passive.shard_entries(key), snapshot.entries);
        }
    }

    #[tokio::test]
    async fn test_ack_then_replicate_eventually_mirrors() {
        let mut cfg = config(4);
        cfg.ack_policy = AckPolicy::AckThenReplicate;
        let active = ActiveMapEntity::new(cfg.clone()).unwrap();
        let passive = Arc::new(PassiveMapEntity::new(cfg).unwrap());
        let id = active.attach_passive(LocalPassiveLink::new(passive.clone()));
        wait_until("initial sync", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;

        active.apply(put("k", "v")).await.unwrap();
        wait_until("replicated put", || passive.get(b"k").is_some()).await;
    }

    #[tokio::test]
    async fn test_lagging_passive_is_reconciled() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        let passive = Arc::new(PassiveMapEntity::new(config(4)).unwrap());
        let link = Arc::new(FailingLink {
            inner: LocalPassiveLink::new(passive.clone()),
            failing: AtomicBool::new(false),
        });
        let id = active.attach_passive(link.clone());
        wait_until("initial sync", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;

        link.failing.store(true, Ordering::SeqCst);
        active.apply(put("missed", "1")).await.unwrap();
        assert_ne!(active.passive_status(&id), Some(PassiveStatus::Synced));
        assert_eq!(passive.get(b"missed"), None);

        // The active keeps serving while the passive is out.
        active.apply(put("also-missed", "2")).await.unwrap();
        link.failing.store(false, Ordering::SeqCst);

        wait_until("reconciliation", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;
        assert_eq!(passive.get(b"missed"), Some(b"1".to_vec()));
        assert_eq!(passive.get(b"also-missed"), Some(b"2".to_vec()));

        active.apply(put("later", "3")).await.unwrap();
        assert_eq!(passive.get(b"later"), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn test_detached_passive_receives_nothing() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        let passive = Arc::new(PassiveMapEntity::new(config(4)).unwrap());
        let id = active.attach_passive(LocalPassiveLink::new(passive.clone()));
        wait_until("initial sync", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;

        assert!(active.detach_passive(&id));
        assert!(!active.detach_passive(&id));
        assert_eq!(active.passive_status(&id), None);

        active.apply(put("k", "v")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(passive.get(b"k"), None);
    }

    #[tokio::test]
    async fn test_promoted_passive_serves_clients() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        let passive = Arc::new(PassiveMapEntity::new(config(4)).unwrap());
        let id = active.attach_passive(LocalPassiveLink::new(passive.clone()));
        wait_until("initial sync", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;
        active.apply(put("k", "v")).await.unwrap();

        let promoted = passive.promote(Vec::new()).await.unwrap();
        assert_eq!(
            promoted.apply(get("k")).await.unwrap(),
            MapResponse::Value(Some(b"v".to_vec()))
        );
        promoted.apply(put("k2", "w")).await.unwrap();
        assert_eq!(promoted.len(), 2);

        // The old role is gone.
        let replay = passive
            .replay(ReplicatedOperation {
                key: promoted.strategy().concurrency_key(&get("x")),
                sequence: 100,
                operation: get("x"),
            })
            .await;
        assert_eq!(replay, Err(EntityError::NotPassive));
        assert!(matches!(
            passive.promote(Vec::new()).await,
            Err(EntityError::NotPassive)
        ));
    }

    #[tokio::test]
    async fn test_promoted_active_syncs_new_passive() {
        let passive = Arc::new(PassiveMapEntity::new(config(2)).unwrap());
        passive
            .reconcile(crate::codec::sync::ShardSnapshot {
                key: ConcurrencyKey(0),
                sequence: 4,
                entries: vec![],
            })
            .await
            .unwrap();
        let promoted = passive.promote(Vec::new()).await.unwrap();
        promoted.apply(put("a", "1")).await.unwrap();

        let standby = Arc::new(PassiveMapEntity::new(config(2)).unwrap());
        let id = promoted.attach_passive(LocalPassiveLink::new(standby.clone()));
        wait_until("standby sync", || {
            promoted.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;
        assert_eq!(standby.get(b"a"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_passive_attached_during_writes_matches_active() {
        let active = ActiveMapEntity::new(config(8)).unwrap();
        for i in 0..40 {
            active.apply(put(&format!("k{}", i), "0")).await.unwrap();
        }
        let passive = Arc::new(PassiveMapEntity::new(config(8)).unwrap());

        let mut writers = Vec::new();
        for writer in 0..4 {
            let active = active.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..60 {
                    let key = format!("k{}", (writer * 7 + i) % 40);
                    let operation = if writer == 0 && i % 15 == 14 {
                        MapOperation::Clear
                    } else if i % 3 == 0 {
                        MapOperation::Remove {
                            key: key.into_bytes(),
                        }
                    } else {
                        put(&key, &format!("{}-{}", writer, i))
                    };
                    active.apply(operation).await.unwrap();
                    if i % 5 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        let id = active.attach_passive(LocalPassiveLink::new(passive.clone()));
        for writer in writers {
            writer.await.unwrap();
        }

        wait_until("sync under load", || {
            active.passive_status(&id) == Some(PassiveStatus::Synced)
        })
        .await;
        // Acknowledged by a synced passive, so everything queued before it arrived too.
        active.apply(put("last", "1")).await.unwrap();

        for key in active.strategy().all_keys() {
            let snapshot = active.snapshot(key).await.unwrap();
            assert_eq!(passive.shard_entries(key), snapshot.entries, "{} diverged", key);
        }
        assert_eq!(passive.len(), active.len());
    }

    #[tokio::test]
    async fn test_retired_handle_is_never_reconciled() {
        let passive = Arc::new(PassiveMapEntity::new(config(2)).unwrap());
        let (lagging_tx, mut lagging_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = PassiveHandle::spawn(
            PassiveId::new(),
            LocalPassiveLink::new(passive),
            lagging_tx,
            tracing::Span::none(),
        );

        handle.retire();
        assert_eq!(handle.status(), PassiveStatus::Retired);
        assert_eq!(handle.begin_reconcile(), None);
        assert!(!handle.mark_lagging(handle.epoch()));
        assert!(lagging_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detach_during_backoff_skips_reconcile() {
        let active = ActiveMapEntity::new(config(4)).unwrap();
        active.apply(put("k", "v")).await.unwrap();
        let passive = Arc::new(PassiveMapEntity::new(config(4)).unwrap());
        let link = Arc::new(FailingLink {
            inner: LocalPassiveLink::new(passive.clone()),
            failing: AtomicBool::new(true),
        });

        let id = active.attach_passive(link.clone());
        // First attempt fails; the next one is waiting out its backoff.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(active.detach_passive(&id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.failing.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(passive.is_empty());
        assert_eq!(active.passive_status(&id), None);
    }
}
