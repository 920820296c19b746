// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-process connection hub.
//!
//! One task owns every room and every connection's outbound sender. All
//! membership changes and local broadcasts are commands processed in arrival
//! order, so no lock guards room state.
//!
//! # Architecture
//!
//! ```text
//!  socket read tasks ──┐                          ┌──► outbound queue ──► write task
//!  (broadcast)         │     ┌──────────────┐     ├──► outbound queue ──► write task
//!  upgrade handler ────┼────►│   Hub task   │─────┤
//!  (register)          │     │  rooms,      │     └──► outbound queue ──► write task
//!  socket exit ────────┘     │  locations   │
//!  (unregister)              └──┬────────▲──┘
//!                               │        │ remote queue
//!                 subscribe /   │        │ (echo-filtered)
//!                 unsubscribe / ▼        │
//!                 publish   ┌────────────┴──┐
//!                           │    Bridge     │
//!                           └───────────────┘
//! ```
//!
//! # Slow consumers
//!
//! Fanout uses `try_send`. A connection whose queue is full is evicted in the
//! same cycle: removed from its room, its queue closed with
//! [`CloseReason::SlowConsumer`]. One slow reader never delays the others.
//!
//! # Loop prevention
//!
//! Only envelopes from local connections are handed to the bridge. Envelopes
//! that arrived from the bridge are fanned out locally and never republished;
//! any carrying this instance's id are dropped.

mod connection;
mod room;

pub use connection::{CloseReason, Connection, ConnectionState, LivenessWatch, OutboundQueue};
pub use room::DocumentRoom;

use crate::bridge::Bridge;
use crate::config::HubConfig;
use crate::envelope::{ConnectionId, Envelope, Identity, InstanceId, SharedEnvelope};
use crate::error::{FanoutError, Result};
use crate::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Snapshot of hub state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    pub rooms: usize,
    pub connections: usize,
    pub shutting_down: bool,
}

enum Command {
    Register {
        connection: Connection,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        id: ConnectionId,
    },
    Broadcast {
        envelope: SharedEnvelope,
    },
    Members {
        document_id: String,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Where an envelope entered the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

/// Cloneable handle to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
    instance_id: InstanceId,
    outbound_capacity: usize,
}

impl HubHandle {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Capacity given to each connection's outbound queue.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    /// Create a connection sized for this hub and register it.
    pub async fn open_connection(
        &self,
        identity: Identity,
        document_id: &str,
    ) -> Result<(ConnectionId, OutboundQueue)> {
        let (connection, queue) = Connection::open(identity, document_id, self.outbound_capacity);
        let id = connection.id();
        self.register(connection).await?;
        Ok((id, queue))
    }

    /// Attach a connection to its document room.
    pub async fn register(&self, connection: Connection) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register { connection, reply }).await?;
        rx.await.map_err(|_| FanoutError::ShuttingDown)?
    }

    /// Detach a connection. Idempotent; unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.send(Command::Unregister { id }).await;
    }

    /// Fan an envelope from a local connection out to its room and the bridge.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.send(Command::Broadcast {
            envelope: Arc::new(envelope),
        })
        .await
    }

    /// Connection ids attached to a document, sorted.
    pub async fn room_members(&self, document_id: &str) -> Result<Vec<ConnectionId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Members {
            document_id: document_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| FanoutError::ShuttingDown)
    }

    pub async fn stats(&self) -> Result<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| FanoutError::ShuttingDown)
    }

    /// Refuse new registrations and close every connection.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| FanoutError::ShuttingDown)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| FanoutError::ShuttingDown)
    }
}

/// The hub task's state.
pub struct Hub {
    instance_id: InstanceId,
    bridge: Arc<dyn Bridge>,
    rooms: HashMap<String, DocumentRoom>,
    locations: HashMap<ConnectionId, String>,
    shutting_down: bool,
}

impl Hub {
    /// Spawn the hub task.
    ///
    /// `remote_rx` carries envelopes relayed in by the bridge; the bridge
    /// holds the matching sender.
    pub fn spawn(
        config: &HubConfig,
        instance_id: InstanceId,
        bridge: Arc<dyn Bridge>,
        remote_rx: mpsc::Receiver<Envelope>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let hub = Hub {
            instance_id,
            bridge,
            rooms: HashMap::new(),
            locations: HashMap::new(),
            shutting_down: false,
        };
        let span = tracing::info_span!("hub", instance_id = %instance_id);
        let handle = tokio::spawn(hub.run(rx, remote_rx).instrument(span));

        (
            HubHandle {
                tx,
                instance_id,
                outbound_capacity: config.outbound_queue_capacity.max(1),
            },
            handle,
        )
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut remote: mpsc::Receiver<Envelope>) {
        info!("Hub started");
        let mut remote_open = true;

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                envelope = remote.recv(), if remote_open => match envelope {
                    Some(envelope) => self.broadcast(Arc::new(envelope), Origin::Remote),
                    None => {
                        debug!("Remote queue closed");
                        remote_open = false;
                    }
                },
            }
        }

        self.close_all(CloseReason::ShuttingDown);
        info!("Hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { connection, reply } => {
                let _ = reply.send(self.register(connection));
            }
            Command::Unregister { id } => self.unregister(&id, CloseReason::Unregistered),
            Command::Broadcast { envelope } => self.broadcast(envelope, Origin::Local),
            Command::Members { document_id, reply } => {
                let members = self
                    .rooms
                    .get(&document_id)
                    .map(DocumentRoom::member_ids)
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => {
                if !self.shutting_down {
                    info!(connections = self.locations.len(), "Hub shutting down");
                    self.shutting_down = true;
                    self.close_all(CloseReason::ShuttingDown);
                }
                let _ = reply.send(());
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            rooms: self.rooms.len(),
            connections: self.locations.len(),
            shutting_down: self.shutting_down,
        }
    }

    fn register(&mut self, connection: Connection) -> Result<()> {
        if self.shutting_down {
            metrics::record_registration_rejected("shutting_down");
            connection.close(CloseReason::ShuttingDown);
            return Err(FanoutError::ShuttingDown);
        }
        let id = connection.id();
        if let Some(existing) = self.locations.get(&id) {
            metrics::record_registration_rejected("duplicate");
            return Err(FanoutError::InvalidState {
                expected: "unregistered connection".to_string(),
                actual: format!("already in room {}", existing),
            });
        }

        let document_id = connection.document_id().to_string();
        let user_id = connection.identity().user_id.clone();
        let room = self
            .rooms
            .entry(document_id.clone())
            .or_insert_with(|| DocumentRoom::new(document_id.clone()));
        let first = room.attach(connection);
        let members = room.len();
        self.locations.insert(id, document_id.clone());

        if first {
            self.bridge.subscribe_document(&document_id);
        }

        metrics::record_connection_registered();
        self.update_gauges();
        debug!(
            document_id = %document_id,
            connection_id = %id,
            user_id = %user_id,
            members,
            "Connection registered"
        );
        Ok(())
    }

    fn unregister(&mut self, id: &ConnectionId, reason: CloseReason) {
        let Some(document_id) = self.locations.remove(id) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&document_id) else {
            return;
        };
        let Some((connection, empty)) = room.detach(id) else {
            return;
        };
        connection.close(reason);

        if empty {
            self.rooms.remove(&document_id);
            self.bridge.unsubscribe_document(&document_id);
        }

        metrics::record_connection_closed(reason.as_str());
        self.update_gauges();
        debug!(
            document_id = %document_id,
            connection_id = %id,
            reason = reason.as_str(),
            "Connection unregistered"
        );
    }

    fn broadcast(&mut self, envelope: SharedEnvelope, origin: Origin) {
        let document_id = envelope.document_id.as_str();

        let exclude = match origin {
            Origin::Local => {
                // Only members may write to a room.
                let is_member = self
                    .rooms
                    .get(document_id)
                    .is_some_and(|room| room.contains(&envelope.sender_connection_id));
                if !is_member {
                    debug!(
                        document_id,
                        connection_id = %envelope.sender_connection_id,
                        "Dropping broadcast from a connection not in the room"
                    );
                    return;
                }
                Some(envelope.sender_connection_id)
            }
            Origin::Remote => {
                if envelope.is_from(self.instance_id) {
                    metrics::record_echo_suppressed();
                    return;
                }
                None
            }
        };

        let report = match self.rooms.get(document_id) {
            Some(room) => room.fanout(&envelope, exclude),
            None => Default::default(),
        };
        metrics::record_local_broadcast(report.delivered);

        for id in &report.overflowed {
            warn!(
                document_id,
                connection_id = %id,
                "Outbound queue full, dropping slow consumer"
            );
            metrics::record_slow_consumer_evicted();
        }
        let overflowed = report.overflowed;
        let closed = report.closed;
        let document_id = document_id.to_string();
        for id in overflowed {
            self.unregister(&id, CloseReason::SlowConsumer);
        }
        for id in closed {
            debug!(document_id = %document_id, connection_id = %id, "Outbound queue closed");
            self.unregister(&id, CloseReason::Unregistered);
        }

        if origin == Origin::Local {
            self.bridge.publish(&envelope);
        }
    }

    fn close_all(&mut self, reason: CloseReason) {
        let rooms: Vec<DocumentRoom> = self.rooms.drain().map(|(_, room)| room).collect();
        for mut room in rooms {
            for connection in room.drain() {
                metrics::record_connection_closed(reason.as_str());
                connection.close(reason);
            }
            self.bridge.unsubscribe_document(room.document_id());
        }
        self.locations.clear();
        self.update_gauges();
    }

    fn update_gauges(&self) {
        metrics::set_active_connections(self.locations.len());
        metrics::set_active_rooms(self.rooms.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::envelope::PayloadKind;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum BridgeCall {
        Subscribe(String),
        Unsubscribe(String),
        Publish(String),
    }

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<BridgeCall>>,
    }

    impl RecordingBridge {
        fn calls(&self) -> Vec<BridgeCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Bridge for RecordingBridge {
        fn subscribe_document(&self, document_id: &str) {
            self.calls.lock().unwrap().push(BridgeCall::Subscribe(document_id.to_string()));
        }
        fn unsubscribe_document(&self, document_id: &str) {
            self.calls.lock().unwrap().push(BridgeCall::Unsubscribe(document_id.to_string()));
        }
        fn publish(&self, envelope: &Envelope) {
            self.calls
                .lock()
                .unwrap()
                .push(BridgeCall::Publish(String::from_utf8_lossy(&envelope.payload).to_string()));
        }
    }

    struct Fixture {
        hub: HubHandle,
        bridge: Arc<RecordingBridge>,
        remote_tx: mpsc::Sender<Envelope>,
        _task: JoinHandle<()>,
    }

    fn fixture(outbound_capacity: usize) -> Fixture {
        let config = HubConfig {
            outbound_queue_capacity: outbound_capacity,
            ..HubConfig::for_testing()
        };
        let bridge = Arc::new(RecordingBridge::default());
        let (remote_tx, remote_rx) = mpsc::channel(16);
        let (hub, task) = Hub::spawn(&config, InstanceId::generate(), bridge.clone(), remote_rx);
        Fixture {
            hub,
            bridge,
            remote_tx,
            _task: task,
        }
    }

    fn identity(name: &str) -> Identity {
        Identity::new(format!("id-{}", name), name)
    }

    fn local(hub: &HubHandle, doc: &str, sender: ConnectionId, payload: &str) -> Envelope {
        Envelope::new(doc, sender, hub.instance_id(), payload.as_bytes().to_vec(), PayloadKind::Text)
    }

    async fn recv(queue: &mut OutboundQueue) -> Option<SharedEnvelope> {
        tokio::time::timeout(Duration::from_millis(200), queue.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_peer_not_sender() {
        let f = fixture(8);
        let (a, mut qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();
        let (_b, mut qb) = f.hub.open_connection(identity("b"), "doc-1").await.unwrap();

        f.hub.broadcast(local(&f.hub, "doc-1", a, "hello")).await.unwrap();
        f.hub.stats().await.unwrap(); // barrier

        let got = recv(&mut qb).await.expect("B should receive");
        assert_eq!(got.payload, b"hello");
        assert!(qb.try_recv().is_none(), "exactly one copy");
        assert!(qa.try_recv().is_none(), "sender gets no echo");

        assert!(f.bridge.calls().contains(&BridgeCall::Publish("hello".to_string())));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let f = fixture(8);
        let (a, _qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();
        let (_c, mut qc) = f.hub.open_connection(identity("c"), "doc-2").await.unwrap();

        f.hub.broadcast(local(&f.hub, "doc-1", a, "x")).await.unwrap();
        f.hub.stats().await.unwrap();
        assert!(qc.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_ref_count_drives_bridge_subscription() {
        let f = fixture(8);
        let (a, _qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();
        let (b, _qb) = f.hub.open_connection(identity("b"), "doc-1").await.unwrap();
        f.hub.unregister(a).await;
        f.hub.unregister(b).await;
        f.hub.stats().await.unwrap();

        assert_eq!(
            f.bridge.calls(),
            vec![
                BridgeCall::Subscribe("doc-1".to_string()),
                BridgeCall::Unsubscribe("doc-1".to_string()),
            ]
        );
        let stats = f.hub.stats().await.unwrap();
        assert_eq!(stats.rooms, 0);
        assert_eq!(stats.connections, 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let f = fixture(8);
        let (a, mut qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();
        f.hub.unregister(a).await;
        f.hub.unregister(a).await;
        f.hub.unregister(ConnectionId::generate()).await;

        let stats = f.hub.stats().await.unwrap();
        assert_eq!(stats.connections, 0);
        assert!(qa.recv().await.is_none());
        assert_eq!(qa.close_reason(), Some(CloseReason::Unregistered));

        let unsubscribes = f
            .bridge
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BridgeCall::Unsubscribe(_)))
            .count();
        assert_eq!(unsubscribes, 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_evicted_in_one_cycle() {
        let f = fixture(2);
        let (a, _qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();
        let (slow, mut q_slow) = f.hub.open_connection(identity("slow"), "doc-1").await.unwrap();
        let (_fast, mut q_fast) = f.hub.open_connection(identity("fast"), "doc-1").await.unwrap();

        for i in 0..3 {
            f.hub.broadcast(local(&f.hub, "doc-1", a, &format!("m{}", i))).await.unwrap();
            // fast reader keeps up
            f.hub.stats().await.unwrap();
            assert!(q_fast.try_recv().is_some());
        }

        let members = f.hub.room_members("doc-1").await.unwrap();
        assert!(!members.contains(&slow), "slow consumer should be evicted");
        assert_eq!(members.len(), 2);

        // The two buffered envelopes drain, then the queue ends
        assert!(q_slow.recv().await.is_some());
        assert!(q_slow.recv().await.is_some());
        assert!(q_slow.recv().await.is_none());
        assert_eq!(q_slow.close_reason(), Some(CloseReason::SlowConsumer));
    }

    #[tokio::test]
    async fn test_dropped_queue_is_unregistered() {
        let f = fixture(4);
        let (a, _qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();
        let (_b, qb) = f.hub.open_connection(identity("b"), "doc-1").await.unwrap();
        drop(qb);

        f.hub.broadcast(local(&f.hub, "doc-1", a, "x")).await.unwrap();
        assert_eq!(f.hub.room_members("doc-1").await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_non_member_broadcast_dropped() {
        let f = fixture(4);
        let (_a, mut qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();

        let stranger = ConnectionId::generate();
        f.hub.broadcast(local(&f.hub, "doc-1", stranger, "spoof")).await.unwrap();
        f.hub.stats().await.unwrap();

        assert!(qa.try_recv().is_none());
        assert!(!f
            .bridge
            .calls()
            .iter()
            .any(|c| matches!(c, BridgeCall::Publish(_))));
    }

    #[tokio::test]
    async fn test_remote_envelope_fanned_out_not_republished() {
        let f = fixture(4);
        let (_a, mut qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();

        let remote = Envelope::new(
            "doc-1",
            ConnectionId::generate(),
            InstanceId::generate(),
            b"from-afar".to_vec(),
            PayloadKind::Binary,
        );
        f.remote_tx.send(remote).await.unwrap();

        let got = recv(&mut qa).await.expect("remote envelope delivered");
        assert_eq!(got.payload, b"from-afar");
        assert_eq!(got.payload_kind, PayloadKind::Binary);
        assert!(!f
            .bridge
            .calls()
            .iter()
            .any(|c| matches!(c, BridgeCall::Publish(_))));
    }

    #[tokio::test]
    async fn test_remote_echo_dropped() {
        let f = fixture(4);
        let (_a, mut qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();

        let echo = local(&f.hub, "doc-1", ConnectionId::generate(), "echo");
        let marker = Envelope::new(
            "doc-1",
            ConnectionId::generate(),
            InstanceId::generate(),
            b"marker".to_vec(),
            PayloadKind::Text,
        );
        f.remote_tx.send(echo).await.unwrap();
        f.remote_tx.send(marker).await.unwrap();

        // The remote queue is FIFO, so the marker arriving first proves the echo was dropped
        let got = recv(&mut qa).await.expect("marker delivered");
        assert_eq!(got.payload, b"marker");
        assert!(qa.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_same_user_can_hold_two_connections() {
        let f = fixture(4);
        let (first, _q1) = Connection::open(identity("a"), "doc-1", 4);
        let (second, _q2) = Connection::open(identity("a"), "doc-1", 4);
        assert_ne!(first.id(), second.id());
        f.hub.register(first).await.unwrap();
        f.hub.register(second).await.unwrap();
        assert_eq!(f.hub.stats().await.unwrap().connections, 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_rejects() {
        let f = fixture(4);
        let (_a, mut qa) = f.hub.open_connection(identity("a"), "doc-1").await.unwrap();
        let (_b, mut qb) = f.hub.open_connection(identity("b"), "doc-2").await.unwrap();

        f.hub.shutdown().await.unwrap();

        assert!(qa.recv().await.is_none());
        assert!(qb.recv().await.is_none());
        assert_eq!(qa.close_reason(), Some(CloseReason::ShuttingDown));

        let result = f.hub.open_connection(identity("c"), "doc-1").await;
        assert!(matches!(result, Err(FanoutError::ShuttingDown)));

        let stats = f.hub.stats().await.unwrap();
        assert!(stats.shutting_down);
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.rooms, 0);

        let calls = f.bridge.calls();
        assert!(calls.contains(&BridgeCall::Unsubscribe("doc-1".to_string())));
        assert!(calls.contains(&BridgeCall::Unsubscribe("doc-2".to_string())));

        // Second shutdown is a no-op
        f.hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_after_hub_dropped() {
        let config = HubConfig::for_testing();
        let (_remote_tx, remote_rx) = mpsc::channel(1);
        let (hub, task) = Hub::spawn(&config, InstanceId::generate(), Arc::new(crate::bridge::NoOpBridge), remote_rx);
        task.abort();
        let _ = task.await;
        assert!(matches!(hub.stats().await, Err(FanoutError::ShuttingDown)));
    }
}
