//! Partitioning of the durable log and stream entry parsing.
//!
//! The topic is sharded into one Redis stream per partition:
//!
//! ```text
//! document-updates:0   document-updates:1   document-updates:2
//!        ▲                     ▲                    ▲
//!        └──── sha256(document_id)[0..8] mod N ─────┘
//! ```
//!
//! Every edit for a document lands on the same stream, so stream entry ids
//! give a total order per document.

use crate::envelope::{EditEvent, EditVersion};
use crate::error::{FanoutError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Stream field holding the partition key.
pub const FIELD_DOCUMENT_ID: &str = "document_id";

/// Stream field holding the JSON-encoded [`EditEvent`].
pub const FIELD_EVENT: &str = "event";

/// Partition for `document_id` out of `partitions`.
///
/// Stable across processes and restarts (unlike `DefaultHasher`).
pub fn partition_for(document_id: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(document_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

/// Stream key of one partition.
pub fn stream_key(topic: &str, partition: u32) -> String {
    format!("{}:{}", topic, partition)
}

/// Stream key for the partition a document maps to.
pub fn stream_key_for(topic: &str, document_id: &str, partitions: u32) -> String {
    stream_key(topic, partition_for(document_id, partitions))
}

/// An entry read back from a partition stream.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub stream_id: String,
    pub version: EditVersion,
    pub event: EditEvent,
}

/// Decode the fields of one stream entry.
pub fn parse_entry(stream_id: &str, fields: &HashMap<String, redis::Value>) -> Result<LogEntry> {
    let version = EditVersion::parse(stream_id)
        .ok_or_else(|| FanoutError::Decode(format!("Invalid stream id: {}", stream_id)))?;
    let raw = get_bytes_field(fields, FIELD_EVENT)?;
    let event = EditEvent::decode(&raw)?;

    // The routing field must agree with the body; a mismatch means the entry
    // was written by something other than the producer.
    if let Ok(document_id) = get_string_field(fields, FIELD_DOCUMENT_ID) {
        if document_id != event.document_id {
            return Err(FanoutError::Decode(format!(
                "document_id field {} does not match event {}",
                document_id, event.document_id
            )));
        }
    }

    Ok(LogEntry {
        stream_id: stream_id.to_string(),
        version,
        event,
    })
}

/// Extract a string field from a stream entry.
pub(crate) fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| FanoutError::Decode(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| FanoutError::Decode(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(FanoutError::Decode(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from a stream entry.
pub(crate) fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| FanoutError::Decode(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(FanoutError::Decode(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}
