// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-instance pub/sub bridge.
//!
//! Connects the local hub to a shared broadcast medium so that edits from
//! clients attached to other gateway processes reach local clients.
//!
//! # Architecture
//!
//! ```text
//!            Hub task                                 Redis
//!  ┌──────────────────────────┐                 ┌──────────────┐
//!  │ ref_count 0→1 ───────────┼─subscribe_doc──►│              │
//!  │ ref_count 1→0 ───────────┼─unsubscribe────►│  doc:<id>    │
//!  │ local broadcast ─────────┼─publish───┐     │  channels    │
//!  └──────────▲───────────────┘           │     └──┬───────▲───┘
//!             │ remote queue              ▼        │       │
//!             │                   ┌─────────────┐  │       │
//!             │                   │ publisher   │──┼───────┘ PUBLISH (FIFO)
//!             │                   │ task        │  │
//!             │                   └─────────────┘  │
//!  ┌──────────┴──────────┐                         │
//!  │ subscriber task     │◄────────────────────────┘ messages
//!  │ echo filter (origin)│
//!  └─────────────────────┘
//! ```
//!
//! The hub never waits on the medium: [`Bridge`] methods only record intent
//! (desired subscriptions) or enqueue (publishes). The subscriber task
//! reconciles the desired set against what the medium has, and re-subscribes
//! everything after a reconnect.
//!
//! # Degraded mode
//!
//! While the medium is unreachable the process keeps serving local clients
//! (single-instance fanout). Publishes that cannot be delivered are dropped
//! and counted; `fanout_bridge_connected` reads 0.

use crate::broker::open_and_ping;
use crate::config::BridgeConfig;
use crate::envelope::{Envelope, InstanceId};
use crate::error::{FanoutError, Result};
use crate::lifecycle::wait_for_shutdown;
use crate::metrics;
use dashmap::DashSet;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Per-attempt timeout for opening a medium connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the hub needs from the cross-instance medium.
///
/// Called from inside the hub task, so implementations must not block.
pub trait Bridge: Send + Sync + 'static {
    /// First local connection for `document_id` attached.
    fn subscribe_document(&self, document_id: &str);

    /// Last local connection for `document_id` left.
    fn unsubscribe_document(&self, document_id: &str);

    /// Relay a locally originated envelope to other instances.
    fn publish(&self, envelope: &Envelope);

    /// Whether the medium is currently reachable.
    fn is_connected(&self) -> bool {
        false
    }
}

/// Bridge for single-instance deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpBridge;

impl Bridge for NoOpBridge {
    fn subscribe_document(&self, _document_id: &str) {}
    fn unsubscribe_document(&self, _document_id: &str) {}
    fn publish(&self, _envelope: &Envelope) {}
}

/// Inbound path from the medium into the hub's remote queue.
///
/// Drops envelopes that this instance produced.
#[derive(Debug, Clone)]
pub struct BridgeInbound {
    instance_id: InstanceId,
    tx: mpsc::Sender<Envelope>,
}

impl BridgeInbound {
    pub fn new(instance_id: InstanceId, tx: mpsc::Sender<Envelope>) -> Self {
        Self { instance_id, tx }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Forward `envelope` to the hub unless it is our own echo.
    ///
    /// Returns `true` if it was forwarded.
    pub async fn deliver(&self, envelope: Envelope) -> bool {
        if envelope.is_from(self.instance_id) {
            metrics::record_echo_suppressed();
            debug!(document_id = %envelope.document_id, "Suppressed echo of own envelope");
            return false;
        }
        metrics::record_bridge_received();
        if self.tx.send(envelope).await.is_err() {
            debug!("Hub remote queue closed, dropping relayed envelope");
            return false;
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RedisBridge
// ═══════════════════════════════════════════════════════════════════════════════

/// Bridge over Redis pub/sub, one channel per document.
pub struct RedisBridge {
    desired: Arc<DashSet<String>>,
    notify: Arc<Notify>,
    publish_tx: mpsc::Sender<Envelope>,
    connected: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisBridge {
    /// Spawn the subscriber and publisher tasks. Does not wait for the medium.
    pub fn start(config: BridgeConfig, inbound: BridgeInbound) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            FanoutError::Config(format!("Invalid bridge Redis URL {}: {}", config.redis_url, e))
        })?;

        let desired = Arc::new(DashSet::new());
        let notify = Arc::new(Notify::new());
        let connected = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_queue_capacity.max(1));
        metrics::set_bridge_connected(false);

        let subscriber = Subscriber {
            client: client.clone(),
            config: config.clone(),
            desired: Arc::clone(&desired),
            notify: Arc::clone(&notify),
            inbound,
            connected: Arc::clone(&connected),
        };
        let publisher = Publisher {
            client,
            config,
            conn: None,
            last_connect_attempt: None,
        };

        let sub_handle = tokio::spawn(
            subscriber
                .run(stop_rx.clone())
                .instrument(tracing::info_span!("bridge_subscriber")),
        );
        let pub_handle = tokio::spawn(
            publisher
                .run(publish_rx, stop_rx)
                .instrument(tracing::info_span!("bridge_publisher")),
        );

        Ok(Self {
            desired,
            notify,
            publish_tx,
            connected,
            stop_tx,
            handles: Mutex::new(vec![sub_handle, pub_handle]),
        })
    }

    /// Documents the bridge should currently be subscribed to.
    pub fn desired_documents(&self) -> Vec<String> {
        let mut docs: Vec<String> = self.desired.iter().map(|d| d.clone()).collect();
        docs.sort();
        docs
    }

    /// Stop both tasks, waiting at most `grace`.
    pub async fn stop(&self, grace: Duration) {
        self.stop_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut h) => h.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Bridge task did not stop within grace period, aborting");
                handle.abort();
            }
        }
        self.connected.store(false, Ordering::Release);
        metrics::set_bridge_connected(false);
        info!("Bridge stopped");
    }
}

impl Bridge for RedisBridge {
    fn subscribe_document(&self, document_id: &str) {
        if self.desired.insert(document_id.to_string()) {
            self.notify.notify_one();
        }
    }

    fn unsubscribe_document(&self, document_id: &str) {
        if self.desired.remove(document_id).is_some() {
            self.notify.notify_one();
        }
    }

    fn publish(&self, envelope: &Envelope) {
        match self.publish_tx.try_send(envelope.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_bridge_publish_dropped("queue_full");
                warn!(document_id = %envelope.document_id, "Bridge publish queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::record_bridge_publish_dropped("closed");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

enum SessionEnd {
    Disconnected(String),
    Stopped,
}

struct Subscriber {
    client: Client,
    config: BridgeConfig,
    desired: Arc<DashSet<String>>,
    notify: Arc<Notify>,
    inbound: BridgeInbound,
    connected: Arc<AtomicBool>,
}

impl Subscriber {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let interval = self.config.reconnect_interval_duration();
        let mut attempt = 0usize;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            attempt += 1;

            let end = match tokio::time::timeout(CONNECT_TIMEOUT, self.client.get_async_pubsub()).await {
                Ok(Ok(pubsub)) => {
                    attempt = 0;
                    self.set_connected(true);
                    info!("Bridge connected");
                    let end = self.session(pubsub, &mut stop_rx).await;
                    self.set_connected(false);
                    end
                }
                Ok(Err(e)) => SessionEnd::Disconnected(e.to_string()),
                Err(_) => SessionEnd::Disconnected("connect timed out".to_string()),
            };

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Disconnected(reason) => {
                    warn!(
                        attempt,
                        delay_ms = interval.as_millis() as u64,
                        error = %reason,
                        "Bridge medium unavailable, degrading to single-instance fanout"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = wait_for_shutdown(&mut stop_rx) => break,
                    }
                }
            }
        }
        debug!("Bridge subscriber stopped");
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        metrics::set_bridge_connected(connected);
    }

    /// One connected session: reconcile subscriptions, then relay messages
    /// until the connection drops or stop is signalled.
    async fn session(&self, mut pubsub: PubSub, stop_rx: &mut watch::Receiver<bool>) -> SessionEnd {
        let mut subscribed: HashSet<String> = HashSet::new();
        if let Err(e) = self.reconcile(&mut pubsub, &mut subscribed).await {
            return SessionEnd::Disconnected(e.to_string());
        }

        loop {
            tokio::select! {
                msg = async { pubsub.on_message().next().await } => {
                    let Some(msg) = msg else {
                        return SessionEnd::Disconnected("pub/sub stream closed".to_string());
                    };
                    self.relay(msg.get_channel_name(), msg.get_payload_bytes()).await;
                }
                _ = self.notify.notified() => {
                    if let Err(e) = self.reconcile(&mut pubsub, &mut subscribed).await {
                        return SessionEnd::Disconnected(e.to_string());
                    }
                }
                _ = wait_for_shutdown(stop_rx) => return SessionEnd::Stopped,
            }
        }
    }

    /// Bring the medium's subscriptions in line with the desired set.
    async fn reconcile(
        &self,
        pubsub: &mut PubSub,
        subscribed: &mut HashSet<String>,
    ) -> redis::RedisResult<()> {
        let want: HashSet<String> = self.desired.iter().map(|d| d.clone()).collect();
        let to_add: Vec<String> = want.difference(subscribed).cloned().collect();
        let to_remove: Vec<String> = subscribed.difference(&want).cloned().collect();

        for document_id in to_add {
            pubsub.subscribe(self.config.channel_for(&document_id)).await?;
            metrics::record_bridge_subscription("subscribe");
            debug!(document_id = %document_id, "Bridge subscribed");
            subscribed.insert(document_id);
        }
        for document_id in to_remove {
            pubsub.unsubscribe(self.config.channel_for(&document_id)).await?;
            metrics::record_bridge_subscription("unsubscribe");
            debug!(document_id = %document_id, "Bridge unsubscribed");
            subscribed.remove(&document_id);
        }
        Ok(())
    }

    async fn relay(&self, channel: &str, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::record_bridge_decode_failure();
                warn!(channel, error = %e, "Undecodable bridge message");
                return;
            }
        };
        if self.config.document_for(channel) != Some(envelope.document_id.as_str()) {
            metrics::record_bridge_decode_failure();
            warn!(
                channel,
                document_id = %envelope.document_id,
                "Bridge message on the wrong channel, dropping"
            );
            return;
        }
        self.inbound.deliver(envelope).await;
    }
}

struct Publisher {
    client: Client,
    config: BridgeConfig,
    conn: Option<ConnectionManager>,
    last_connect_attempt: Option<Instant>,
}

impl Publisher {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>, mut stop_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                envelope = rx.recv() => match envelope {
                    Some(envelope) => self.publish(envelope).await,
                    None => break,
                },
                _ = wait_for_shutdown(&mut stop_rx) => break,
            }
        }
        debug!("Bridge publisher stopped");
    }

    /// Connection for publishing, reconnecting at most once per interval.
    async fn connection(&mut self) -> Option<ConnectionManager> {
        if let Some(conn) = &self.conn {
            return Some(conn.clone());
        }
        let interval = self.config.reconnect_interval_duration();
        if self
            .last_connect_attempt
            .is_some_and(|at| at.elapsed() < interval)
        {
            return None;
        }
        self.last_connect_attempt = Some(Instant::now());

        match tokio::time::timeout(CONNECT_TIMEOUT, open_and_ping(&self.client)).await {
            Ok(Ok(conn)) => {
                info!("Bridge publisher connected");
                self.conn = Some(conn.clone());
                Some(conn)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Bridge publisher connect failed");
                None
            }
            Err(_) => {
                warn!("Bridge publisher connect timed out");
                None
            }
        }
    }

    async fn publish(&mut self, envelope: Envelope) {
        let Some(mut conn) = self.connection().await else {
            metrics::record_bridge_publish_dropped("disconnected");
            return;
        };
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                metrics::record_bridge_publish_dropped("encode");
                warn!(error = %e, "Failed to encode envelope for bridge");
                return;
            }
        };
        let channel = self.config.channel_for(&envelope.document_id);
        let result: redis::RedisResult<i64> = conn.publish(&channel, payload).await;
        match result {
            Ok(receivers) => {
                metrics::record_bridge_publish(true);
                debug!(channel = %channel, receivers, "Envelope published");
            }
            Err(e) => {
                metrics::record_bridge_publish(false);
                warn!(channel = %channel, error = %e, "Bridge publish failed, dropping");
            }
        }
    }
}
