// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed document store.
//!
//! Each document row carries the log position of its last applied edit. The
//! position check and the write happen in one `BEGIN IMMEDIATE` transaction,
//! so two consumers racing on the same document (e.g. during a lease
//! handover) cannot both apply the same edit.
//!
//! ```text
//! documents                         document_edits
//! ┌──────────────┬─────────┐        ┌──────────────┬─────────┬─────────┐
//! │ document_id  │ version │        │ document_id  │ version │ payload │
//! │ applied_ms   │ seq     │        │ applied_ms   │ seq     │ at      │
//! └──────────────┴─────────┘        └──────────────┴─────────┴─────────┘
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY / SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling up to 500ms) and counted in
//! `fanout_store_retries_total`.

use super::store::{ApplyOutcome, BoxFuture, DocumentStore, StoreError};
use crate::envelope::{epoch_millis, EditVersion};
use crate::error::{FanoutError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // Extended codes (e.g. SQLITE_BUSY_SNAPSHOT = 517) carry the
            // primary code in the low byte: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            let busy_code = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false);
            let msg = db_err.message().to_lowercase();
            busy_code || msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Document store persisted in a local SQLite file (WAL mode).
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteDocumentStore {
    /// Open (or create) the store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing document store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| FanoutError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(250))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                applied_ms INTEGER NOT NULL,
                applied_seq INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_edits (
                document_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                applied_ms INTEGER NOT NULL,
                applied_seq INTEGER NOT NULL,
                payload BLOB NOT NULL,
                applied_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, version)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path: path_str })
    }

    /// Path to the database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Applied payloads for a document, oldest first.
    pub async fn edits(&self, document_id: &str) -> Result<Vec<Vec<u8>>> {
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "SELECT payload FROM document_edits WHERE document_id = ? ORDER BY version",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Document store closed");
    }
}

async fn apply_in_transaction(
    pool: &SqlitePool,
    document_id: &str,
    payload: &[u8],
    produced: EditVersion,
) -> std::result::Result<ApplyOutcome, sqlx::Error> {
    // Take the write lock up front; a deferred transaction that reads first
    // cannot upgrade once another writer has committed.
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

    let row: Option<(i64, i64, i64)> = sqlx::query_as(
        "SELECT version, applied_ms, applied_seq FROM documents WHERE document_id = ?",
    )
    .bind(document_id)
    .fetch_optional(&mut *tx)
    .await?;

    let next_version = match row {
        Some((version, ms, seq)) => {
            let current = EditVersion::new(ms as u64, seq as u64);
            if produced <= current {
                tx.rollback().await?;
                return Ok(ApplyOutcome::Stale { current });
            }
            version + 1
        }
        None => 1,
    };

    let now = epoch_millis() as i64;

    sqlx::query(
        r#"
        INSERT INTO documents (document_id, version, applied_ms, applied_seq, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            version = excluded.version,
            applied_ms = excluded.applied_ms,
            applied_seq = excluded.applied_seq,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(document_id)
    .bind(next_version)
    .bind(produced.millis as i64)
    .bind(produced.seq as i64)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO document_edits (document_id, version, applied_ms, applied_seq, payload, applied_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(document_id)
    .bind(next_version)
    .bind(produced.millis as i64)
    .bind(produced.seq as i64)
    .bind(payload)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(ApplyOutcome::Applied {
        version: next_version as u64,
    })
}

impl DocumentStore for SqliteDocumentStore {
    fn apply_edit(
        &self,
        document_id: &str,
        payload: &[u8],
        produced_version: EditVersion,
    ) -> BoxFuture<'_, ApplyOutcome> {
        let document_id = document_id.to_string();
        let payload = payload.to_vec();
        Box::pin(async move {
            execute_with_retry("apply_edit", || {
                apply_in_transaction(&self.pool, &document_id, &payload, produced_version)
            })
            .await
            .map_err(|e| StoreError(e.to_string()))
        })
    }

    fn current_version(&self, document_id: &str) -> BoxFuture<'_, Option<EditVersion>> {
        let document_id = document_id.to_string();
        Box::pin(async move {
            let row: Option<(i64, i64)> = execute_with_retry("current_version", || {
                sqlx::query_as("SELECT applied_ms, applied_seq FROM documents WHERE document_id = ?")
                    .bind(&document_id)
                    .fetch_optional(&self.pool)
            })
            .await
            .map_err(|e| StoreError(e.to_string()))?;
            Ok(row.map(|(ms, seq)| EditVersion::new(ms as u64, seq as u64)))
        })
    }
}
