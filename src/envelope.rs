//! Wire types shared by the hub, the bridge and the ingestion pipeline.
//!
//! ```text
//! client frame ──► Envelope ──► local connections       (hub)
//!                     │
//!                     ├──────► Redis channel doc:<id>    (bridge, JSON)
//!                     │
//!                     └──────► EditEvent ──► <topic>:<p> (producer, JSON)
//!                                                │
//!                                                ▼
//!                              EditVersion = stream entry id (consumer)
//! ```
//!
//! Payloads are opaque. They are forwarded byte-for-byte and hex-encoded when
//! embedded in JSON.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Process-lifetime identifier of one gateway instance.
///
/// Generated once at startup; never derived from a network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authenticated identity returned by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// WebSocket frame type the payload arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    #[default]
    Text,
    Binary,
}

/// One client edit as it travels between connections and instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub document_id: String,
    pub sender_connection_id: ConnectionId,
    pub origin_instance_id: InstanceId,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub payload_kind: PayloadKind,
    /// Milliseconds since the Unix epoch.
    pub sent_at: u64,
}

impl Envelope {
    /// Wrap a payload received from a local connection.
    pub fn new(
        document_id: impl Into<String>,
        sender_connection_id: ConnectionId,
        origin_instance_id: InstanceId,
        payload: Vec<u8>,
        payload_kind: PayloadKind,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            sender_connection_id,
            origin_instance_id,
            payload,
            payload_kind,
            sent_at: epoch_millis(),
        }
    }

    /// True when this instance produced the envelope.
    pub fn is_from(&self, instance_id: InstanceId) -> bool {
        self.origin_instance_id == instance_id
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Envelope shared between every outbound queue of a room.
pub type SharedEnvelope = Arc<Envelope>;

/// Durable record of one accepted edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditEvent {
    pub document_id: String,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub produced_at: u64,
    pub producer_instance_id: InstanceId,
}

impl EditEvent {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            document_id: envelope.document_id.clone(),
            payload: envelope.payload.clone(),
            produced_at: epoch_millis(),
            producer_instance_id: envelope.origin_instance_id,
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Position of an edit on its partition: a Redis stream entry id.
///
/// All edits of a document land on the same partition, so versions of one
/// document are strictly increasing in log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EditVersion {
    pub millis: u64,
    pub seq: u64,
}

impl EditVersion {
    pub const ZERO: EditVersion = EditVersion { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Parse a `<millis>-<seq>` stream id. A bare `<millis>` means seq 0.
    pub fn parse(stream_id: &str) -> Option<Self> {
        match stream_id.split_once('-') {
            Some((millis, seq)) => Some(Self {
                millis: millis.parse().ok()?,
                seq: seq.parse().ok()?,
            }),
            None => Some(Self {
                millis: stream_id.parse().ok()?,
                seq: 0,
            }),
        }
    }
}

impl Ord for EditVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EditVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EditVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// Get current epoch milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            "doc-1",
            ConnectionId::generate(),
            InstanceId::generate(),
            br#"{"op":"insert","pos":5,"text":"hi"}"#.to_vec(),
            PayloadKind::Text,
        )
    }

    #[test]
    fn test_envelope_json_keeps_payload_bytes() {
        let envelope = sample_envelope();
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.payload, br#"{"op":"insert","pos":5,"text":"hi"}"#.to_vec());
    }

    #[test]
    fn test_envelope_payload_is_hex_on_the_wire() {
        let mut envelope = sample_envelope();
        envelope.payload = vec![0x00, 0xff, 0x10];
        envelope.payload_kind = PayloadKind::Binary;
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["payload"], "00ff10");
        assert_eq!(json["payload_kind"], "binary");
    }

    #[test]
    fn test_envelope_origin_check() {
        let envelope = sample_envelope();
        assert!(envelope.is_from(envelope.origin_instance_id));
        assert!(!envelope.is_from(InstanceId::generate()));
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(crate::FanoutError::Decode(_))
        ));
    }

    #[test]
    fn test_edit_event_from_envelope() {
        let envelope = sample_envelope();
        let event = EditEvent::from_envelope(&envelope);
        assert_eq!(event.document_id, "doc-1");
        assert_eq!(event.payload, envelope.payload);
        assert_eq!(event.producer_instance_id, envelope.origin_instance_id);
        assert!(event.produced_at >= envelope.sent_at);

        let decoded = EditEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_edit_version_parse() {
        assert_eq!(EditVersion::parse("1700000000000-3"), Some(EditVersion::new(1_700_000_000_000, 3)));
        assert_eq!(EditVersion::parse("42"), Some(EditVersion::new(42, 0)));
        assert_eq!(EditVersion::parse("abc-1"), None);
        assert_eq!(EditVersion::parse("1-x"), None);
        assert_eq!(EditVersion::parse(""), None);
    }

    #[test]
    fn test_edit_version_ordering() {
        let a = EditVersion::new(100, 5);
        let b = EditVersion::new(100, 6);
        let c = EditVersion::new(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(EditVersion::ZERO < a);
        assert_eq!(c.to_string(), "101-0");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }

    #[test]
    fn test_epoch_millis() {
        let now = epoch_millis();
        // Should be after 2020-01-01
        assert!(now > 1_577_836_800_000);
    }
}
