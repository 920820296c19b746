//! Per-document room: the connections attached to one document in this process.

use super::connection::{Connection, DeliveryFailure};
use crate::envelope::{ConnectionId, SharedEnvelope};
use std::collections::HashMap;

/// Connections attached to one document, plus the bridge reference count.
///
/// `ref_count` is kept as an explicit field rather than derived from the map
/// so the subscribe/unsubscribe transitions are visible at the call site:
/// [`attach`](Self::attach) reports 0→1 and [`detach`](Self::detach) reports 1→0.
#[derive(Debug)]
pub struct DocumentRoom {
    document_id: String,
    connections: HashMap<ConnectionId, Connection>,
    ref_count: usize,
}

/// Result of one fanout pass over a room.
#[derive(Debug, Default)]
pub(crate) struct FanoutReport {
    pub delivered: usize,
    /// Queues that were full; these connections must be evicted.
    pub overflowed: Vec<ConnectionId>,
    /// Queues whose write task is gone.
    pub closed: Vec<ConnectionId>,
}

impl DocumentRoom {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            connections: HashMap::new(),
            ref_count: 0,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ref_count == 0
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Add a connection. Returns `true` if it is the first member.
    pub(crate) fn attach(&mut self, connection: Connection) -> bool {
        let first = self.ref_count == 0;
        if self.connections.insert(connection.id(), connection).is_none() {
            self.ref_count += 1;
        }
        first
    }

    /// Remove a connection. Returns it and whether the room became empty.
    pub(crate) fn detach(&mut self, id: &ConnectionId) -> Option<(Connection, bool)> {
        let connection = self.connections.remove(id)?;
        self.ref_count = self.ref_count.saturating_sub(1);
        Some((connection, self.ref_count == 0))
    }

    /// Remove every connection (shutdown).
    pub(crate) fn drain(&mut self) -> Vec<Connection> {
        self.ref_count = 0;
        self.connections.drain().map(|(_, c)| c).collect()
    }

    /// Enqueue `envelope` to every member except `exclude`.
    pub(crate) fn fanout(
        &self,
        envelope: &SharedEnvelope,
        exclude: Option<ConnectionId>,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        for (id, connection) in &self.connections {
            if Some(*id) == exclude {
                continue;
            }
            match connection.deliver(envelope) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryFailure::Overflow) => report.overflowed.push(*id),
                Err(DeliveryFailure::Closed) => report.closed.push(*id),
            }
        }
        report
    }
}
