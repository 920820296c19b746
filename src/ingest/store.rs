// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store integration.
//!
//! The consumer writes accepted edits through [`DocumentStore`]. The store
//! owns the canonical document; this crate only needs the apply contract:
//!
//! ```text
//! apply_edit(doc, payload, produced_version)
//!     produced_version >  last applied  →  Applied { version }   (write happens)
//!     produced_version <= last applied  →  Stale { current }     (no write)
//! ```
//!
//! Redelivery after a crash therefore never applies an edit twice, and an
//! edit overtaken by a newer one is discarded rather than reported as an
//! error.
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_fanout::envelope::EditVersion;
//! use doc_fanout::ingest::{ApplyOutcome, BoxFuture, DocumentStore, StoreError};
//!
//! struct MyStore;
//!
//! impl DocumentStore for MyStore {
//!     fn apply_edit(
//!         &self,
//!         _document_id: &str,
//!         _payload: &[u8],
//!         produced_version: EditVersion,
//!     ) -> BoxFuture<'_, ApplyOutcome> {
//!         Box::pin(async move { Ok(ApplyOutcome::Applied { version: 1 }) })
//!     }
//!
//!     fn current_version(&self, _document_id: &str) -> BoxFuture<'_, Option<EditVersion>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::envelope::EditVersion;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::Mutex;

/// Result type for document store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for document store operations.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for crate::error::FanoutError {
    fn from(e: StoreError) -> Self {
        crate::error::FanoutError::Store(e.0)
    }
}

/// Outcome of applying one edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Edit written; `version` is the document's new revision counter.
    Applied { version: u64 },
    /// Edit not newer than what the document already reflects.
    Stale { current: EditVersion },
}

/// What the consumer needs from canonical storage.
pub trait DocumentStore: Send + Sync + 'static {
    /// Apply `payload` to the document if `produced_version` is newer than
    /// the last applied edit. Must be idempotent.
    fn apply_edit(
        &self,
        document_id: &str,
        payload: &[u8],
        produced_version: EditVersion,
    ) -> BoxFuture<'_, ApplyOutcome>;

    /// Position of the last applied edit, or `None` for an untouched document.
    fn current_version(&self, document_id: &str) -> BoxFuture<'_, Option<EditVersion>>;
}

/// A document as held by [`MemoryDocumentStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredDocument {
    /// Revision counter, incremented per applied edit.
    pub version: u64,
    /// Log position of the last applied edit.
    pub last_applied: EditVersion,
    /// Applied payloads in order.
    pub edits: Vec<Vec<u8>>,
}

/// In-process store for development and tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one document.
    pub async fn document(&self, document_id: &str) -> Option<StoredDocument> {
        self.documents.lock().await.get(document_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn apply_edit(
        &self,
        document_id: &str,
        payload: &[u8],
        produced_version: EditVersion,
    ) -> BoxFuture<'_, ApplyOutcome> {
        let document_id = document_id.to_string();
        let payload = payload.to_vec();
        Box::pin(async move {
            let mut documents = self.documents.lock().await;
            let document = documents.entry(document_id).or_default();

            if document.version > 0 && produced_version <= document.last_applied {
                return Ok(ApplyOutcome::Stale {
                    current: document.last_applied,
                });
            }

            document.version += 1;
            document.last_applied = produced_version;
            document.edits.push(payload);
            Ok(ApplyOutcome::Applied {
                version: document.version,
            })
        })
    }

    fn current_version(&self, document_id: &str) -> BoxFuture<'_, Option<EditVersion>> {
        let document_id = document_id.to_string();
        Box::pin(async move {
            Ok(self
                .documents
                .lock()
                .await
                .get(&document_id)
                .filter(|d| d.version > 0)
                .map(|d| d.last_applied))
        })
    }
}
