//! Edit producer: appends accepted edits to the durable log.
//!
//! ```text
//! read task ──append()──► [bounded queue] ──► producer task ──XADD──► <topic>:<p>
//!            (try_send,                        (retry with backoff)
//!             never waits)
//! ```
//!
//! The connection's read loop must never wait on the broker, so `append` only
//! enqueues. A full queue drops the event (logged at `error`, counted in
//! `fanout_edit_events_dropped_total`). Delivery to the log is at-least-once:
//! a send that fails after the broker accepted it is retried and may land
//! twice, which the consumer's stale check absorbs.

use super::partition::{partition_for, stream_key, FIELD_DOCUMENT_ID, FIELD_EVENT};
use super::EditLog;
use crate::config::LogConfig;
use crate::envelope::EditEvent;
use crate::error::{FanoutError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Bounded, non-blocking front of the durable log.
pub struct EditProducer {
    tx: mpsc::Sender<EditEvent>,
    capacity: usize,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EditProducer {
    /// Start the background sender on an established connection.
    pub fn spawn(conn: ConnectionManager, config: &LogConfig, retry: RetryConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = watch::channel(false);

        let sender = LogSender {
            conn,
            topic: config.topic.clone(),
            partitions: config.partitions.max(1),
            retry,
        };
        let span = tracing::info_span!("edit_producer", topic = %config.topic);
        let handle = tokio::spawn(sender.run(rx, stop_rx).instrument(span));

        Self {
            tx,
            capacity,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Events waiting to be sent.
    pub fn pending(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Send what is queued and stop, giving up after `grace`.
    pub async fn drain(&self, grace: Duration) {
        self.stop_tx.send_replace(true);
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        let Some(handle) = handle else {
            return;
        };

        let pending = self.pending();
        if join_or_abort(handle, grace).await {
            info!("Edit producer drained");
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                pending,
                "Edit producer did not drain within grace period, remaining events lost"
            );
        }
    }
}

/// Wait up to `grace` for `handle`, aborting it if still running.
async fn join_or_abort(mut handle: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(_) => true,
        Err(_) => {
            handle.abort();
            false
        }
    }
}

impl EditLog for EditProducer {
    fn append(&self, event: EditEvent) -> Result<()> {
        enqueue(&self.tx, self.capacity, event)
    }
}

/// `try_send` with the drop-on-full policy.
pub(crate) fn enqueue(tx: &mpsc::Sender<EditEvent>, capacity: usize, event: EditEvent) -> Result<()> {
    match tx.try_send(event) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(event)) => {
            error!(
                document_id = %event.document_id,
                capacity,
                "Edit log queue full, dropping edit event"
            );
            metrics::record_edit_dropped("queue_full");
            Err(FanoutError::Backpressure {
                connection_id: "edit-producer".to_string(),
                capacity,
            })
        }
        Err(mpsc::error::TrySendError::Closed(event)) => {
            warn!(document_id = %event.document_id, "Edit log closed, dropping edit event");
            metrics::record_edit_dropped("closed");
            Err(FanoutError::ShuttingDown)
        }
    }
}

struct LogSender {
    conn: ConnectionManager,
    topic: String,
    partitions: u32,
    retry: RetryConfig,
}

impl LogSender {
    async fn run(mut self, mut rx: mpsc::Receiver<EditEvent>, mut stop_rx: watch::Receiver<bool>) {
        debug!("Edit producer started");
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(event) => self.send(event).await,
                    None => break,
                },
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(event) = rx.recv().await {
            self.send(event).await;
            drained += 1;
        }
        debug!(drained, "Edit producer stopped");
    }

    async fn send(&mut self, event: EditEvent) {
        let key = stream_key(&self.topic, partition_for(&event.document_id, self.partitions));
        let encoded = match event.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(document_id = %event.document_id, error = %e, "Failed to encode edit event");
                metrics::record_edit_dropped("encode");
                return;
            }
        };
        let fields = [
            (FIELD_DOCUMENT_ID, event.document_id.as_bytes().to_vec()),
            (FIELD_EVENT, encoded),
        ];

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let result: redis::RedisResult<String> = self.conn.xadd(&key, "*", &fields[..]).await;
            match result {
                Ok(id) => {
                    metrics::record_edit_produced(true);
                    debug!(document_id = %event.document_id, stream = %key, id = %id, "Edit event appended");
                    return;
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        document_id = %event.document_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "XADD failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::record_edit_produced(false);
                    metrics::record_edit_dropped("send_failed");
                    error!(
                        document_id = %event.document_id,
                        attempts = attempt,
                        error = %e,
                        "Failed to append edit event after retries, dropping"
                    );
                    return;
                }
            }
        }
    }
}
