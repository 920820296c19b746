//! Durable ingestion pipeline.
//!
//! The gateway appends every accepted edit to a partitioned log
//! ([`EditProducer`]); a separate worker ([`EditConsumer`]) reads the log and
//! applies edits to the [`DocumentStore`] idempotently.
//!
//! | Piece | Where it runs | Module |
//! |-------|---------------|--------|
//! | [`EditLog`] / [`EditProducer`] | gateway | `producer` |
//! | partitioning, entry parsing | both | `partition` |
//! | [`EditConsumer`] | edit-consumer | `consumer` |
//! | partition leases, membership | edit-consumer | `lease` |
//! | [`DocumentStore`] + impls | edit-consumer | `store`, `sqlite` |

pub mod consumer;
pub mod lease;
pub mod partition;
pub mod producer;
pub mod sqlite;
pub mod store;

pub use consumer::{EditConsumer, EntryOutcome};
pub use lease::PartitionLeases;
pub use partition::{partition_for, stream_key, LogEntry};
pub use producer::EditProducer;
pub use sqlite::SqliteDocumentStore;
pub use store::{
    ApplyOutcome, BoxFuture, DocumentStore, MemoryDocumentStore, StoreError, StoreResult,
    StoredDocument,
};

use crate::envelope::EditEvent;
use crate::error::Result;

/// Where the gateway sends accepted edits.
///
/// `append` must not wait on the broker: it is called from a connection's
/// read loop.
pub trait EditLog: Send + Sync + 'static {
    fn append(&self, event: EditEvent) -> Result<()>;
}
