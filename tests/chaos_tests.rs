// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or lost local fanout.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

use doc_fanout::bridge::{Bridge, BridgeInbound, RedisBridge};
use doc_fanout::broker::{connect_with_retry, retry_fixed};
use doc_fanout::config::{BridgeConfig, ConsumerConfig, HubConfig};
use doc_fanout::envelope::{ConnectionId, EditEvent, EditVersion, Envelope, Identity, InstanceId, PayloadKind};
use doc_fanout::hub::{CloseReason, Hub};
use doc_fanout::ingest::consumer::process_batch;
use doc_fanout::ingest::{
    ApplyOutcome, BoxFuture, DocumentStore, EditConsumer, EntryOutcome, LogEntry, MemoryDocumentStore,
    StoreResult,
};
use doc_fanout::lifecycle::{ServiceState, Shutdown};
use doc_fanout::resilience::{Bulkhead, RetryConfig};
use doc_fanout::FanoutError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const UNREACHABLE: &str = "redis://127.0.0.1:1";

// =============================================================================
// Broker Unavailability
// =============================================================================

/// Test: Unbounded connect keeps retrying until shutdown, then stops cleanly
#[tokio::test]
async fn unreachable_broker_retries_until_shutdown() {
    let (tx, mut rx) = watch::channel(false);
    let retry = RetryConfig::fixed(usize::MAX, Duration::from_millis(20), Duration::from_millis(200));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send_replace(true);
    });

    let started = std::time::Instant::now();
    let result = connect_with_retry("chaos", UNREACHABLE, &retry, &mut rx).await;
    assert!(matches!(result, Err(FanoutError::ShuttingDown)));
    assert!(started.elapsed() >= Duration::from_millis(250));
}

/// Test: The subscribe ceiling of 20 attempts ends in BrokerUnreachable
#[tokio::test]
async fn subscribe_ceiling_is_fatal() {
    let (_tx, mut rx) = watch::channel(false);
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let retry = RetryConfig::fixed(20, Duration::from_millis(1), Duration::from_millis(100));
    assert_eq!(RetryConfig::subscribe().max_attempts, 20);

    let result: doc_fanout::Result<()> = retry_fixed("subscribe", &retry, &mut rx, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(FanoutError::redis_msg("XGROUP CREATE", "connection refused")) }
    })
    .await;

    match result {
        Err(FanoutError::BrokerUnreachable { attempts: n, .. }) => assert_eq!(n, 20),
        other => panic!("expected BrokerUnreachable, got {:?}", other),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 20);
}

/// Test: Consumer blocked in connect honours shutdown and reports Stopped
#[tokio::test]
async fn consumer_without_broker_stops_on_shutdown() {
    let store = Arc::new(MemoryDocumentStore::new());
    let consumer = EditConsumer::new(ConsumerConfig::for_testing(UNREACHABLE), store);
    let shutdown = Shutdown::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.trigger();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), consumer.run(shutdown.subscribe())).await;
    assert!(matches!(result, Ok(Ok(()))));
    assert_eq!(consumer.state(), ServiceState::Stopped);
    assert!(consumer.owned_partitions().is_empty());
}

// =============================================================================
// Bridge Degradation
// =============================================================================

/// Test: With the medium down, local fanout still works and publishes never block
#[tokio::test]
async fn local_fanout_survives_bridge_outage() {
    let instance_id = InstanceId::generate();
    let (remote_tx, remote_rx) = mpsc::channel(8);
    let config = BridgeConfig {
        redis_url: UNREACHABLE.to_string(),
        reconnect_interval: "50ms".to_string(),
        publish_queue_capacity: 4,
        ..Default::default()
    };
    let bridge = Arc::new(RedisBridge::start(config, BridgeInbound::new(instance_id, remote_tx)).unwrap());
    let (hub, _task) = Hub::spawn(&HubConfig::for_testing(), instance_id, bridge.clone(), remote_rx);

    let (a, _qa) = hub.open_connection(Identity::new("a", "a"), "doc-1").await.unwrap();
    let (_b, mut qb) = hub.open_connection(Identity::new("b", "b"), "doc-1").await.unwrap();

    // Far more than the publish queue holds
    for i in 0..6 {
        let envelope = Envelope::new("doc-1", a, instance_id, vec![i], PayloadKind::Binary);
        tokio::time::timeout(Duration::from_secs(1), hub.broadcast(envelope))
            .await
            .expect("broadcast must not block on the bridge")
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), qb.recv()).await.unwrap().unwrap();
        assert_eq!(got.payload, vec![i]);
    }

    assert!(!bridge.is_connected());
    assert_eq!(bridge.desired_documents(), vec!["doc-1".to_string()]);
    bridge.stop(Duration::from_secs(1)).await;
}

// =============================================================================
// Slow Consumers
// =============================================================================

/// Test: One stalled reader among many is evicted; the rest see every message
#[tokio::test]
async fn slow_reader_does_not_stall_room() {
    let (_remote_tx, remote_rx) = mpsc::channel(1);
    let instance_id = InstanceId::generate();
    let config = HubConfig {
        outbound_queue_capacity: 4,
        ..HubConfig::for_testing()
    };
    let (hub, _task) = Hub::spawn(&config, instance_id, Arc::new(doc_fanout::NoOpBridge), remote_rx);

    let (writer, _qw) = hub.open_connection(Identity::new("w", "w"), "doc").await.unwrap();
    let (stalled, mut q_stalled) = hub.open_connection(Identity::new("s", "s"), "doc").await.unwrap();
    let mut readers = Vec::new();
    for i in 0..8 {
        let name = format!("r{}", i);
        readers.push(hub.open_connection(Identity::new(&name, &name), "doc").await.unwrap());
    }

    for round in 0..20u8 {
        let envelope = Envelope::new("doc", writer, instance_id, vec![round], PayloadKind::Binary);
        hub.broadcast(envelope).await.unwrap();
        for (_, queue) in readers.iter_mut() {
            let got = tokio::time::timeout(Duration::from_secs(1), queue.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.payload, vec![round]);
        }
    }

    let members = hub.room_members("doc").await.unwrap();
    assert!(!members.contains(&stalled));
    assert_eq!(members.len(), 9);

    while q_stalled.recv().await.is_some() {}
    assert_eq!(q_stalled.close_reason(), Some(CloseReason::SlowConsumer));
}

// =============================================================================
// Store Failures
// =============================================================================

/// Panics for one document, succeeds for the rest.
struct PanickyStore {
    inner: MemoryDocumentStore,
}

impl DocumentStore for PanickyStore {
    fn apply_edit(
        &self,
        document_id: &str,
        payload: &[u8],
        produced_version: EditVersion,
    ) -> BoxFuture<'_, ApplyOutcome> {
        if document_id == "poison" {
            return Box::pin(explode());
        }
        self.inner.apply_edit(document_id, payload, produced_version)
    }

    fn current_version(&self, document_id: &str) -> BoxFuture<'_, Option<EditVersion>> {
        self.inner.current_version(document_id)
    }
}

async fn explode() -> StoreResult<ApplyOutcome> {
    panic!("store bug")
}

fn entry(doc: &str, ms: u64) -> LogEntry {
    let envelope = Envelope::new(doc, ConnectionId::generate(), InstanceId::generate(), b"e".to_vec(), PayloadKind::Text);
    let version = EditVersion::new(ms, 0);
    LogEntry {
        stream_id: version.to_string(),
        version,
        event: EditEvent::from_envelope(&envelope),
    }
}

/// Test: A panicking apply for one document does not take down the batch
#[tokio::test]
async fn panicking_store_is_contained() {
    let store = Arc::new(PanickyStore {
        inner: MemoryDocumentStore::new(),
    });
    let bulkhead = Arc::new(Bulkhead::new(2));
    let entries = vec![entry("poison", 1), entry("healthy", 2), entry("healthy", 3)];

    let outcomes = process_batch(store.clone(), bulkhead.clone(), entries, Duration::from_secs(1), |_id| async {}).await;

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, EntryOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 2);
    assert_eq!(store.inner.document("healthy").await.unwrap().edits.len(), 2);
    // Permits are returned even when a worker panics
    assert_eq!(bulkhead.available(), 2);
}
