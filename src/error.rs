// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the fanout subsystem.
//!
//! Errors are categorized by where they surface (gateway, hub, broker,
//! document store) and carry enough context to be logged with structured
//! fields.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Auth` | No | Credential rejected, upgrade refused with 401 |
//! | `Upgrade` | No | WebSocket upgrade failed, no client state created |
//! | `ConnectionIo` | No | One client's channel broke, connection unregistered |
//! | `Redis` | Yes | Broker command failed (network, timeout) |
//! | `BrokerUnreachable` | No | Retry loop gave up (ceiling reached) |
//! | `Backpressure` | No | Outbound queue full, connection dropped |
//! | `Store` | Yes | Document store temporarily failing |
//! | `Storage` | No | Local SQLite error |
//! | `Decode` | No | Malformed envelope or edit event |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle or membership violation |
//! | `ShuttingDown` | No | Process is terminating |
//! | `Internal` | No | Unexpected internal error |
//!
//! A stale edit is deliberately absent: it is an expected outcome of
//! at-least-once delivery and is reported as
//! [`ApplyOutcome::Stale`](crate::ingest::ApplyOutcome::Stale).

use thiserror::Error;

/// Result type alias for fanout operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Errors that can occur in the gateway, hub, bridge or ingestion pipeline.
#[derive(Error, Debug)]
pub enum FanoutError {
    /// Bearer credential rejected or the auth collaborator is unavailable.
    ///
    /// Always surfaced before the upgrade so the client gets a 401.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// WebSocket upgrade could not be completed.
    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    /// Read or write failure on a single client channel.
    #[error("Connection I/O error ({connection_id}): {message}")]
    ConnectionIo {
        connection_id: String,
        message: String,
    },

    /// Redis command error (pub/sub, streams, leases).
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// A broker retry loop reached its attempt ceiling.
    #[error("Broker unreachable ({operation}) after {attempts} attempts: {message}")]
    BrokerUnreachable {
        operation: String,
        attempts: usize,
        message: String,
    },

    /// Outbound queue overflowed; the connection is dropped, not the message stream.
    #[error("Outbound queue full for connection {connection_id} (capacity {capacity})")]
    Backpressure {
        connection_id: String,
        capacity: usize,
    },

    /// Document store rejected or failed an apply.
    #[error("Document store error: {0}")]
    Store(String),

    /// SQLite error in the bundled document store.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Envelope or edit event could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress; new work is refused.
    #[error("Shutting down")]
    ShuttingDown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::Store(_) => true,
            Self::BrokerUnreachable { .. } => false, // already retried
            Self::Auth(_) => false,
            Self::Upgrade(_) => false,
            Self::ConnectionIo { .. } => false,
            Self::Backpressure { .. } => false,
            Self::Storage(_) => false,
            Self::Decode(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::ShuttingDown => false,
            Self::Internal(_) => false,
        }
    }

    /// True for failures that only concern one client connection.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Self::ConnectionIo { .. } | Self::Backpressure { .. } | Self::Upgrade(_)
        )
    }
}

impl From<redis::RedisError> for FanoutError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for FanoutError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_redis() {
        let err = FanoutError::redis_msg("XADD", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XADD"));
    }

    #[test]
    fn test_is_retryable_store() {
        let err = FanoutError::Store("database is locked".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_broker_unreachable_is_terminal() {
        let err = FanoutError::BrokerUnreachable {
            operation: "subscribe".to_string(),
            attempts: 20,
            message: "connection refused".to_string(),
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("subscribe"));
        assert!(msg.contains("20 attempts"));
    }

    #[test]
    fn test_not_retryable_auth() {
        let err = FanoutError::Auth("token expired".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_connection_local());
    }

    #[test]
    fn test_connection_local_errors() {
        let io = FanoutError::ConnectionIo {
            connection_id: "c-1".to_string(),
            message: "reset by peer".to_string(),
        };
        let overflow = FanoutError::Backpressure {
            connection_id: "c-2".to_string(),
            capacity: 64,
        };
        assert!(io.is_connection_local());
        assert!(overflow.is_connection_local());
        assert!(overflow.to_string().contains("capacity 64"));
        assert!(!FanoutError::ShuttingDown.is_connection_local());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = FanoutError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_decode_from_serde_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: FanoutError = parse.unwrap_err().into();
        assert!(matches!(err, FanoutError::Decode(_)));
    }

    #[test]
    fn test_redis_error_formatting() {
        let err = FanoutError::Redis {
            operation: "PUBLISH".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Redis error"));
        assert!(msg.contains("PUBLISH"));
        assert!(msg.contains("timeout"));
    }
}
