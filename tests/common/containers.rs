// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.

use doc_fanout::envelope::EditEvent;
use doc_fanout::ingest::partition::{stream_key_for, FIELD_DOCUMENT_ID, FIELD_EVENT};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (pub/sub + streams).
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis broker container plus helpers for inspecting the edit log.
pub struct TestBroker<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestBroker<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            redis_url,
        }
    }

    pub async fn connection(&self) -> ConnectionManager {
        let client = redis::Client::open(self.redis_url.as_str()).unwrap();
        client.get_connection_manager().await.unwrap()
    }

    /// Append an edit the way the producer does.
    pub async fn append_edit(&self, topic: &str, partitions: u32, event: &EditEvent) -> String {
        let mut conn = self.connection().await;
        let key = stream_key_for(topic, &event.document_id, partitions);
        let body = event.encode().unwrap();
        let fields: Vec<(&str, Vec<u8>)> = vec![
            (FIELD_DOCUMENT_ID, event.document_id.as_bytes().to_vec()),
            (FIELD_EVENT, body),
        ];
        conn.xadd(&key, "*", &fields[..]).await.unwrap()
    }

    /// Append raw bytes as the event field (for undecodable entries).
    pub async fn append_raw(&self, stream: &str, document_id: &str, raw: &[u8]) -> String {
        let mut conn = self.connection().await;
        let fields: Vec<(&str, Vec<u8>)> = vec![
            (FIELD_DOCUMENT_ID, document_id.as_bytes().to_vec()),
            (FIELD_EVENT, raw.to_vec()),
        ];
        conn.xadd(stream, "*", &fields[..]).await.unwrap()
    }

    pub async fn stream_len(&self, stream: &str) -> usize {
        let mut conn = self.connection().await;
        conn.xlen(stream).await.unwrap()
    }

    /// Entries delivered to the group but not yet acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let mut conn = self.connection().await;
        let reply: redis::streams::StreamPendingReply = conn.xpending(stream, group).await.unwrap();
        reply.count()
    }
}
