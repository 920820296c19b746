// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Edit consumer: reads the durable log and applies edits to the store.
//!
//! # Architecture
//!
//! ```text
//!                      ┌─────────────── rebalance loop (every ttl/3) ───────────────┐
//!                      │ heartbeat → live members → target = ceil(P / live)         │
//!                      │ renew owned leases · release extras · acquire up to target │
//!                      └──────────────┬───────────────────────────────┬─────────────┘
//!                                     │ spawn / stop                   │
//!                         ┌───────────▼──────────┐          ┌─────────▼────────────┐
//!                         │ tailer partition-0   │   ...    │ tailer partition-N   │
//!                         │ XREADGROUP (pending  │          │                      │
//!                         │ first, then ">")     │          │                      │
//!                         └───────────┬──────────┘          └──────────────────────┘
//!                                     │ batch grouped by document
//!                  ┌──────────────────┼──────────────────┐
//!                  ▼                  ▼                  ▼
//!            doc A (serial)     doc B (serial)     doc C (serial)   ← bulkhead permits
//!                  │
//!                  └─► apply_edit under deadline → XACK (always)
//! ```
//!
//! # Delivery semantics
//!
//! At-least-once from the log, exactly-once into the store: every entry is
//! acknowledged after its outcome is known (applied, stale, failed, timed out,
//! undecodable). An entry read but not acknowledged before a crash stays in
//! the partition's pending list and is re-read by whichever replica takes the
//! partition next; the store's stale check discards it if it was applied.

use super::lease::{fair_share, PartitionLeases};
use super::partition::{parse_entry, partition_for, stream_key, LogEntry};
use super::store::{ApplyOutcome, DocumentStore};
use crate::broker::{connect_with_retry, ensure_topic, subscribe_with_retry};
use crate::config::ConsumerConfig;
use crate::envelope::InstanceId;
use crate::error::{FanoutError, Result};
use crate::lifecycle::{wait_for_shutdown, Lifecycle, ServiceState};
use crate::metrics;
use crate::resilience::{Bulkhead, RetryConfig};
use dashmap::DashSet;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

/// Pending-list id: re-read entries delivered but never acknowledged.
const PENDING_CURSOR: &str = "0";

/// New-entries id.
const NEW_CURSOR: &str = ">";

/// Pause after a failed read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Outcome of one log entry, as recorded in metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Applied { version: u64 },
    Stale,
    Failed,
    TimedOut,
    Undecodable,
}

impl EntryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryOutcome::Applied { .. } => "applied",
            EntryOutcome::Stale => "stale",
            EntryOutcome::Failed => "failed",
            EntryOutcome::TimedOut => "timeout",
            EntryOutcome::Undecodable => "undecodable",
        }
    }
}

/// Apply one decoded entry to the store, bounded by `deadline`.
///
/// On deadline the apply future is dropped and the entry is not retried.
pub async fn apply_with_deadline<S: DocumentStore + ?Sized>(
    store: &S,
    entry: &LogEntry,
    deadline: Duration,
) -> EntryOutcome {
    let started = Instant::now();
    let document_id = entry.event.document_id.as_str();

    let outcome = match tokio::time::timeout(
        deadline,
        store.apply_edit(document_id, &entry.event.payload, entry.version),
    )
    .await
    {
        Ok(Ok(ApplyOutcome::Applied { version })) => {
            debug!(document_id, produced_version = %entry.version, version, "Edit applied");
            EntryOutcome::Applied { version }
        }
        Ok(Ok(ApplyOutcome::Stale { current })) => {
            debug!(
                document_id,
                produced_version = %entry.version,
                current = %current,
                "Stale edit discarded"
            );
            EntryOutcome::Stale
        }
        Ok(Err(e)) => {
            error!(
                document_id,
                produced_version = %entry.version,
                error = %FanoutError::from(e),
                "Failed to apply edit"
            );
            EntryOutcome::Failed
        }
        Err(_) => {
            error!(
                document_id,
                produced_version = %entry.version,
                deadline_ms = deadline.as_millis() as u64,
                "Edit apply exceeded deadline, dropped"
            );
            EntryOutcome::TimedOut
        }
    };

    metrics::record_edit_applied(outcome.as_str(), started.elapsed());
    outcome
}

/// Split a batch into per-document groups, preserving log order inside each
/// group and first-appearance order across groups.
pub fn group_by_document(entries: Vec<LogEntry>) -> Vec<(String, Vec<LogEntry>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<LogEntry>)> = Vec::new();
    for entry in entries {
        match index.get(&entry.event.document_id) {
            Some(&i) => groups[i].1.push(entry),
            None => {
                index.insert(entry.event.document_id.clone(), groups.len());
                groups.push((entry.event.document_id.clone(), vec![entry]));
            }
        }
    }
    groups
}

/// Apply a batch: documents concurrently (bounded by `bulkhead`), each
/// document's entries sequentially. `ack` runs after every entry's outcome.
///
/// Returns when every entry of the batch has been handled.
pub async fn process_batch<S, A, Fut>(
    store: Arc<S>,
    bulkhead: Arc<Bulkhead>,
    entries: Vec<LogEntry>,
    deadline: Duration,
    ack: A,
) -> Vec<EntryOutcome>
where
    S: DocumentStore + ?Sized,
    A: Fn(String) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut tasks = JoinSet::new();
    for (document_id, group) in group_by_document(entries) {
        if bulkhead.is_full() {
            debug!(document_id = %document_id, "All apply workers busy, waiting");
        }
        let permit = match bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(document_id = %document_id, error = %e, "Worker pool closed");
                break;
            }
        };
        metrics::set_apply_workers(bulkhead.in_flight());
        let store = Arc::clone(&store);
        let workers = Arc::clone(&bulkhead);
        let ack = ack.clone();
        tasks.spawn(async move {
            let mut outcomes = Vec::with_capacity(group.len());
            for entry in group {
                let outcome = apply_with_deadline(store.as_ref(), &entry, deadline).await;
                ack(entry.stream_id).await;
                outcomes.push(outcome);
            }
            drop(permit);
            metrics::set_apply_workers(workers.in_flight());
            outcomes
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(group_outcomes) => outcomes.extend(group_outcomes),
            Err(e) => error!(error = %e, "Edit worker panicked"),
        }
    }
    outcomes
}

// ═══════════════════════════════════════════════════════════════════════════════
// Partition tailer
// ═══════════════════════════════════════════════════════════════════════════════

struct PartitionTailer<S: DocumentStore> {
    conn: ConnectionManager,
    store: Arc<S>,
    bulkhead: Arc<Bulkhead>,
    partition: u32,
    stream: String,
    group: String,
    consumer_name: String,
    batch_size: usize,
    block: Duration,
    deadline: Duration,
}

impl<S: DocumentStore> PartitionTailer<S> {
    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!("Partition tailer started");
        let mut cursor = PENDING_CURSOR;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let read = tokio::select! {
                read = self.read(cursor) => read,
                _ = wait_for_shutdown(&mut stop_rx) => break,
            };

            match read {
                Ok((entries, raw_count)) => {
                    if raw_count == 0 {
                        if cursor == PENDING_CURSOR {
                            debug!("Pending entries drained, tailing new entries");
                            cursor = NEW_CURSOR;
                        }
                        continue;
                    }
                    metrics::record_partition_read(self.partition, raw_count);
                    self.process(entries).await;
                }
                Err(e) => {
                    warn!(error = %e, "Partition read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                        _ = wait_for_shutdown(&mut stop_rx) => break,
                    }
                }
            }
        }

        info!("Partition tailer stopped");
    }

    /// Read one batch. Undecodable entries are acknowledged here and not
    /// returned; the raw count includes them.
    async fn read(&mut self, cursor: &str) -> Result<(Vec<LogEntry>, usize)> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer_name)
            .block(self.block.as_millis() as usize)
            .count(self.batch_size);

        let reply: StreamReadReply = self
            .conn
            .xread_options(&[&self.stream], &[cursor], &opts)
            .await
            .map_err(|e| FanoutError::redis("XREADGROUP", e))?;

        let raw: Vec<StreamId> = reply.keys.into_iter().flat_map(|k| k.ids).collect();
        let raw_count = raw.len();
        let mut entries = Vec::with_capacity(raw_count);

        for id in raw {
            match parse_entry(&id.id, &id.map) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(stream_id = %id.id, error = %e, "Undecodable log entry, acknowledging");
                    metrics::record_edit_applied(EntryOutcome::Undecodable.as_str(), Duration::ZERO);
                    ack(&mut self.conn, &self.stream, &self.group, &id.id).await;
                }
            }
        }

        Ok((entries, raw_count))
    }

    async fn process(&self, entries: Vec<LogEntry>) {
        let conn = self.conn.clone();
        let stream = self.stream.clone();
        let group = self.group.clone();
        let ack_entry = move |stream_id: String| {
            let mut conn = conn.clone();
            let stream = stream.clone();
            let group = group.clone();
            async move { ack(&mut conn, &stream, &group, &stream_id).await }
        };

        process_batch(
            Arc::clone(&self.store),
            Arc::clone(&self.bulkhead),
            entries,
            self.deadline,
            ack_entry,
        )
        .await;
    }
}

async fn ack(conn: &mut ConnectionManager, stream: &str, group: &str, stream_id: &str) {
    let result: redis::RedisResult<i64> = conn.xack(stream, group, &[stream_id]).await;
    if let Err(e) = result {
        // Left pending: re-read and found stale on the next pending pass.
        warn!(stream_id, error = %e, "XACK failed");
    }
}

struct OwnedPartition {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EditConsumer
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer worker: owns a share of the partitions and applies their edits.
pub struct EditConsumer<S: DocumentStore> {
    config: ConsumerConfig,
    store: Arc<S>,
    member_id: String,
    lifecycle: Lifecycle,
    owned: Arc<DashSet<u32>>,
}

impl<S: DocumentStore> EditConsumer<S> {
    pub fn new(config: ConsumerConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            member_id: format!("consumer-{}", InstanceId::generate()),
            lifecycle: Lifecycle::new("consumer"),
            owned: Arc::new(DashSet::new()),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.lifecycle.subscribe()
    }

    /// Partitions currently tailed by this replica, sorted.
    pub fn owned_partitions(&self) -> Vec<u32> {
        let mut owned: Vec<u32> = self.owned.iter().map(|p| *p).collect();
        owned.sort_unstable();
        owned
    }

    /// Connect, join the group and process until `shutdown_rx` fires.
    ///
    /// Returns `Ok(())` on a clean shutdown (including shutdown during
    /// startup) and `BrokerUnreachable` when the group could not be joined
    /// within the attempt ceiling.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        self.lifecycle.set(ServiceState::Connecting);
        let connect_retry = RetryConfig::fixed(
            usize::MAX,
            self.config.retry_interval_duration(),
            RetryConfig::broker_connect().connection_timeout,
        );

        let conn = match connect_with_retry(
            "consumer",
            &self.config.redis_url,
            &connect_retry,
            &mut shutdown_rx,
        )
        .await
        {
            Ok(conn) => conn,
            Err(FanoutError::ShuttingDown) => {
                self.lifecycle.set(ServiceState::Stopped);
                return Ok(());
            }
            Err(e) => {
                self.lifecycle.set(ServiceState::Failed);
                return Err(e);
            }
        };

        let mut setup = conn.clone();
        if let Err(e) = ensure_topic(
            &mut setup,
            &self.config.topic,
            &self.config.group,
            self.config.partitions,
        )
        .await
        {
            warn!(topic = %self.config.topic, error = %e, "Failed to ensure topic, continuing");
        }

        let leases = PartitionLeases::new(
            conn.clone(),
            self.config.topic.clone(),
            self.config.group.clone(),
            self.member_id.clone(),
            self.config.lease_ttl_duration(),
        );

        let joined = subscribe_with_retry(
            &conn,
            &self.config.topic,
            &self.config.group,
            self.config.partitions,
            &self.config.subscribe_retry(),
            &mut shutdown_rx,
            || {
                let leases = leases.clone();
                async move { leases.heartbeat().await }
            },
        )
        .await;

        match joined {
            Ok(()) => {}
            Err(FanoutError::ShuttingDown) => {
                self.lifecycle.set(ServiceState::Stopped);
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Could not join consumer group, giving up");
                self.lifecycle.set(ServiceState::Failed);
                return Err(e);
            }
        }

        self.lifecycle.set(ServiceState::Running);
        info!(
            member_id = %self.member_id,
            partitions = self.config.partitions,
            "Edit consumer running"
        );

        let bulkhead = Arc::new(Bulkhead::new(self.config.max_in_flight));
        let mut owned: HashMap<u32, OwnedPartition> = HashMap::new();
        let tick = (self.config.lease_ttl_duration() / 3).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.rebalance(&conn, &leases, &bulkhead, &mut owned).await;
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        self.lifecycle.set(ServiceState::ShuttingDown);
        self.stop_all(&leases, &mut owned).await;
        self.lifecycle.set(ServiceState::Stopped);
        Ok(())
    }

    async fn rebalance(
        &self,
        conn: &ConnectionManager,
        leases: &PartitionLeases,
        bulkhead: &Arc<Bulkhead>,
        owned: &mut HashMap<u32, OwnedPartition>,
    ) {
        if let Err(e) = leases.heartbeat().await {
            warn!(error = %e, "Membership heartbeat failed");
        }

        // Tailers that exited on their own give their lease back.
        let finished: Vec<u32> = owned
            .iter()
            .filter(|(_, p)| p.handle.is_finished())
            .map(|(p, _)| *p)
            .collect();
        for partition in finished {
            owned.remove(&partition);
            self.owned.remove(&partition);
            let _ = leases.release(partition).await;
            metrics::record_partition_lease("released");
        }

        // Renew, dropping leases that expired or were taken.
        let held: Vec<u32> = owned.keys().copied().collect();
        for partition in held {
            match leases.renew(partition).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(partition, "Partition lease lost");
                    metrics::record_partition_lease("lost");
                    if let Some(task) = owned.remove(&partition) {
                        self.owned.remove(&partition);
                        stop_tailer(partition, task).await;
                    }
                }
                Err(e) => warn!(partition, error = %e, "Lease renewal failed"),
            }
        }

        let live = match leases.live_members().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Could not count live members");
                metrics::set_owned_partitions(owned.len());
                return;
            }
        };
        let target = fair_share(self.config.partitions, live);

        // Over target: hand back the highest partitions.
        if owned.len() > target {
            let mut extra: Vec<u32> = owned.keys().copied().collect();
            extra.sort_unstable_by(|a, b| b.cmp(a));
            extra.truncate(owned.len() - target);
            for partition in extra {
                if let Some(task) = owned.remove(&partition) {
                    self.owned.remove(&partition);
                    stop_tailer(partition, task).await;
                    if let Err(e) = leases.release(partition).await {
                        warn!(partition, error = %e, "Lease release failed");
                    }
                    metrics::record_partition_lease("released");
                    info!(partition, target, live, "Partition handed back");
                }
            }
        }

        // Under target: try free partitions, starting at a member-specific offset
        // so replicas don't all contend for partition 0.
        if owned.len() < target {
            let partitions = self.config.partitions;
            let start = partition_for(&self.member_id, partitions);
            for i in 0..partitions {
                if owned.len() >= target {
                    break;
                }
                let partition = (start + i) % partitions;
                if owned.contains_key(&partition) {
                    continue;
                }
                match leases.try_acquire(partition).await {
                    Ok(true) => {
                        metrics::record_partition_lease("acquired");
                        info!(partition, target, live, "Partition acquired");
                        let task = self.spawn_tailer(conn.clone(), Arc::clone(bulkhead), partition);
                        owned.insert(partition, task);
                        self.owned.insert(partition);
                    }
                    Ok(false) => {}
                    Err(e) => warn!(partition, error = %e, "Lease acquire failed"),
                }
            }
        }

        metrics::set_owned_partitions(owned.len());
    }

    fn spawn_tailer(
        &self,
        conn: ConnectionManager,
        bulkhead: Arc<Bulkhead>,
        partition: u32,
    ) -> OwnedPartition {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stream = stream_key(&self.config.topic, partition);
        let tailer = PartitionTailer {
            conn,
            store: Arc::clone(&self.store),
            bulkhead,
            partition,
            stream: stream.clone(),
            group: self.config.group.clone(),
            consumer_name: format!("partition-{}", partition),
            batch_size: self.config.batch_size,
            block: self.config.poll_timeout_duration(),
            deadline: self.config.message_deadline_duration(),
        };
        let span = tracing::info_span!("partition_tailer", partition, stream = %stream);
        let handle = tokio::spawn(tailer.run(stop_rx).instrument(span));
        OwnedPartition { stop_tx, handle }
    }

    async fn stop_all(&self, leases: &PartitionLeases, owned: &mut HashMap<u32, OwnedPartition>) {
        let grace = self.config.shutdown_grace_duration();
        let partitions: Vec<u32> = owned.keys().copied().collect();
        info!(count = partitions.len(), "Stopping partition tailers");

        for task in owned.values() {
            task.stop_tx.send_replace(true);
        }

        let deadline = tokio::time::Instant::now() + grace;
        for partition in partitions {
            if let Some(task) = owned.remove(&partition) {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let mut handle = task.handle;
                if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                    warn!(partition, "Tailer did not stop within grace period, aborting");
                    handle.abort();
                }
                self.owned.remove(&partition);
                if let Err(e) = leases.release(partition).await {
                    warn!(partition, error = %e, "Lease release failed");
                }
                metrics::record_partition_lease("released");
            }
        }

        if let Err(e) = leases.leave().await {
            warn!(error = %e, "Failed to leave membership set");
        }
        metrics::set_owned_partitions(0);
    }
}

async fn stop_tailer(partition: u32, task: OwnedPartition) {
    task.stop_tx.send_replace(true);
    let mut handle = task.handle;
    // A tailer finishes its current batch; each entry is bounded by the deadline.
    if tokio::time::timeout(Duration::from_secs(30), &mut handle).await.is_err() {
        warn!(partition, "Tailer did not stop, aborting");
        handle.abort();
    }
}
