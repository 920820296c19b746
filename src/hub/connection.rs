//! One client's outbound side, as seen by the hub and by the socket tasks.
//!
//! [`Connection::open`] returns two halves:
//!
//! - [`Connection`] is moved into the hub on registration. Only the hub holds
//!   the queue's sender, so only the hub can deliver to or close it.
//! - [`OutboundQueue`] stays with the socket's write task, which drains it
//!   into the WebSocket.
//!
//! Both halves share a liveness cell so the write task can tell why its queue
//! closed (a slow consumer is cut off without draining; a shutdown gets an
//! explicit close frame).

use crate::envelope::{ConnectionId, Identity, SharedEnvelope};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Liveness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered (or about to be) and receiving fanout.
    Active,
    /// Removed from its room; the write task is finishing.
    Closing,
    /// Write task finished; nothing more will be sent.
    Closed,
}

/// Why the hub closed a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal unregister (client left, read or write failed).
    Unregistered,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// Process shutdown.
    ShuttingDown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unregistered => "unregistered",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::ShuttingDown => "shutting_down",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            CloseReason::Unregistered => 1,
            CloseReason::SlowConsumer => 2,
            CloseReason::ShuttingDown => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CloseReason::Unregistered),
            2 => Some(CloseReason::SlowConsumer),
            3 => Some(CloseReason::ShuttingDown),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Liveness {
    state: AtomicU8,
    reason: AtomicU8,
}

impl Liveness {
    const ACTIVE: u8 = 0;
    const CLOSING: u8 = 1;
    const CLOSED: u8 = 2;

    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            Self::ACTIVE => ConnectionState::Active,
            Self::CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// First reason wins; later closes do not overwrite it.
    fn begin_close(&self, reason: CloseReason) {
        let _ = self
            .reason
            .compare_exchange(0, reason.to_u8(), Ordering::AcqRel, Ordering::Acquire);
        let _ = self.state.compare_exchange(
            Self::ACTIVE,
            Self::CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn finish_close(&self) {
        self.state.store(Self::CLOSED, Ordering::Release);
    }

    fn reason(&self) -> Option<CloseReason> {
        CloseReason::from_u8(self.reason.load(Ordering::Acquire))
    }
}

/// Read-only view of a connection's liveness for the socket's read task.
#[derive(Debug, Clone)]
pub struct LivenessWatch(Arc<Liveness>);

impl LivenessWatch {
    /// `false` once the hub has removed the connection from its room.
    pub fn is_active(&self) -> bool {
        self.0.state() == ConnectionState::Active
    }
}

/// Why a single delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryFailure {
    /// Queue full: the reader is too slow.
    Overflow,
    /// Write task is gone.
    Closed,
}

/// Hub-side half of a client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    document_id: String,
    outbound: mpsc::Sender<SharedEnvelope>,
    capacity: usize,
    liveness: Arc<Liveness>,
}

/// Socket-side half: drained by the write task.
#[derive(Debug)]
pub struct OutboundQueue {
    id: ConnectionId,
    rx: mpsc::Receiver<SharedEnvelope>,
    liveness: Arc<Liveness>,
}

impl Connection {
    /// Create a connection for `document_id` with a bounded outbound queue.
    pub fn open(
        identity: Identity,
        document_id: impl Into<String>,
        capacity: usize,
    ) -> (Connection, OutboundQueue) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let id = ConnectionId::generate();
        let liveness = Arc::new(Liveness::default());

        let connection = Connection {
            id,
            identity,
            document_id: document_id.into(),
            outbound: tx,
            capacity,
            liveness: Arc::clone(&liveness),
        };
        let queue = OutboundQueue { id, rx, liveness };
        (connection, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> ConnectionState {
        self.liveness.state()
    }

    /// Enqueue without waiting.
    pub(crate) fn deliver(&self, envelope: &SharedEnvelope) -> Result<(), DeliveryFailure> {
        match self.outbound.try_send(Arc::clone(envelope)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryFailure::Overflow),
            Err(TrySendError::Closed(_)) => Err(DeliveryFailure::Closed),
        }
    }

    /// Mark closing and drop the sender, ending the write task's stream.
    pub(crate) fn close(self, reason: CloseReason) {
        self.liveness.begin_close(reason);
        // Dropping `self.outbound` closes the queue.
    }
}

impl OutboundQueue {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next envelope, or `None` once the hub has closed the queue and it is drained.
    pub async fn recv(&mut self) -> Option<SharedEnvelope> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<SharedEnvelope> {
        self.rx.try_recv().ok()
    }

    pub fn state(&self) -> ConnectionState {
        self.liveness.state()
    }

    /// Set once the hub has closed the queue.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.liveness.reason()
    }

    pub fn liveness(&self) -> LivenessWatch {
        LivenessWatch(Arc::clone(&self.liveness))
    }

    /// Called by the write task when it exits.
    pub fn mark_closed(&self) {
        self.liveness.finish_close();
    }
}
