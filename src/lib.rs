//! # Document Fanout
//!
//! Real-time fanout for collaborative document editing.
//!
//! ## Architecture
//!
//! Every gateway process relays client edits to the other clients of the same
//! document, across processes through Redis pub/sub, and appends them to a
//! durable log that a separate worker applies to the document store:
//!
//! ```text
//! ┌──────────────────────────── fanout-gateway ───────────────────────────────┐
//! │                                                                           │
//! │  WebSocket ──► read task ──► Hub (actor) ──► outbound queues ──► clients  │
//! │                    │           │    ▲                                     │
//! │                    │   publish │    │ remote envelopes (echo-filtered)    │
//! │                    │           ▼    │                                     │
//! │                    │     ┌──────────┴──┐                                  │
//! │                    │     │   Bridge    │◄──── Redis pub/sub ────► other   │
//! │                    │     └─────────────┘      (doc:<id>)         gateways │
//! │                    ▼                                                      │
//! │             EditProducer ── XADD ──► <topic>:<partition> streams          │
//! └───────────────────────────────────────────────────┬───────────────────────┘
//!                                                     │
//! ┌──────────────────────────── edit-consumer ────────▼───────────────────────┐
//! │  partition leases ──► tailers (XREADGROUP) ──► bounded workers            │
//! │                                                  │ apply (5s deadline)    │
//! │                                                  ▼                        │
//! │                                           DocumentStore ──► XACK          │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery guarantees
//!
//! 1. **Local fanout**: each envelope reaches every other connection of the
//!    room once, or the connection is evicted as a slow consumer.
//! 2. **Cross-instance**: best-effort. A disconnected bridge degrades to
//!    single-instance fanout.
//! 3. **Durable log**: at-least-once. The store discards stale versions, so
//!    redelivery never applies an edit twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_fanout::{FanoutGateway, GatewayConfig};
//! use doc_fanout::lifecycle::Shutdown;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = Shutdown::new();
//!     let gateway = FanoutGateway::new(GatewayConfig::default());
//!     gateway.run(shutdown.subscribe()).await.expect("gateway failed");
//! }
//! ```

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod ingest;
pub mod lifecycle;
pub mod metrics;
pub mod resilience;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, HttpAuthenticator};
pub use bridge::{Bridge, BridgeInbound, NoOpBridge, RedisBridge};
pub use config::{BridgeConfig, ConsumerConfig, GatewayConfig, HubConfig, LogConfig};
pub use envelope::{ConnectionId, EditEvent, EditVersion, Envelope, Identity, InstanceId, PayloadKind};
pub use error::{FanoutError, Result};
pub use gateway::{AppState, FanoutGateway};
pub use hub::{Hub, HubHandle, HubStats};
pub use ingest::{
    ApplyOutcome, DocumentStore, EditConsumer, EditLog, EditProducer, MemoryDocumentStore,
    SqliteDocumentStore,
};
pub use lifecycle::{ServiceState, Shutdown};
