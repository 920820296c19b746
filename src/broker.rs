// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker connection management.
//!
//! Every long-lived Redis handle in the system goes through this module:
//!
//! | Operation | Schedule | Ceiling | On exhaustion |
//! |-----------|----------|---------|---------------|
//! | [`connect_with_retry`] | fixed 5s | none | n/a (only shutdown stops it) |
//! | [`subscribe_with_retry`] | fixed 5s | 20 | `BrokerUnreachable`, worker exits |
//!
//! Each attempt is bounded by [`RetryConfig::connection_timeout`] and a
//! connection only counts as established once it answers `PING` with `PONG`.
//! Attempts and the sleeps between them both race the shutdown signal, so a
//! process stuck in startup still exits promptly on SIGTERM.

use crate::error::{FanoutError, Result};
use crate::ingest::partition::stream_key;
use crate::lifecycle::wait_for_shutdown;
use crate::metrics;
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Run `attempt` on a fixed schedule until it succeeds, the ceiling is hit,
/// or shutdown is signalled.
///
/// The closure receives the 1-based attempt number.
pub async fn retry_fixed<T, F, Fut>(
    operation: &str,
    retry: &RetryConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0usize;

    loop {
        if *shutdown_rx.borrow() {
            return Err(FanoutError::ShuttingDown);
        }

        attempts = attempts.saturating_add(1);

        let outcome = tokio::select! {
            outcome = timeout(retry.connection_timeout, attempt(attempts)) => outcome,
            _ = wait_for_shutdown(shutdown_rx) => return Err(FanoutError::ShuttingDown),
        };

        let last_error = match outcome {
            Ok(Ok(value)) => {
                if attempts > 1 {
                    info!(operation, attempt = attempts, "Broker operation succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(FanoutError::ShuttingDown)) => return Err(FanoutError::ShuttingDown),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", retry.connection_timeout.as_millis()),
        };

        if !retry.is_unbounded() && attempts >= retry.max_attempts {
            error!(
                operation,
                attempts,
                error = %last_error,
                "Broker operation failed after max attempts"
            );
            return Err(FanoutError::BrokerUnreachable {
                operation: operation.to_string(),
                attempts,
                message: last_error,
            });
        }

        let delay = retry.delay_for_attempt(attempts);
        warn!(
            operation,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "Broker operation failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(shutdown_rx) => return Err(FanoutError::ShuttingDown),
        }
    }
}

/// Open a managed connection and verify it with `PING`.
///
/// With [`RetryConfig::broker_connect`] this never gives up; it returns
/// `ShuttingDown` if the shutdown signal fires first.
pub async fn connect_with_retry(
    component: &'static str,
    redis_url: &str,
    retry: &RetryConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<ConnectionManager> {
    let client = Client::open(redis_url)
        .map_err(|e| FanoutError::Config(format!("Invalid Redis URL {}: {}", redis_url, e)))?;

    info!(component, url = %redis_url, "Connecting to broker");

    let conn = retry_fixed("connect", retry, shutdown_rx, |attempt| {
        let client = client.clone();
        async move {
            let result = open_and_ping(&client).await;
            metrics::record_broker_connect(component, result.is_ok());
            if let Err(ref e) = result {
                debug!(component, attempt, error = %e, "Broker connect attempt failed");
            }
            result
        }
    })
    .await?;

    info!(component, "Connected to broker");
    Ok(conn)
}

/// One connect attempt.
///
/// A plain multiplexed connection answers the `PING` first: it fails as soon
/// as the socket is refused, where the manager would run its own backoff.
pub(crate) async fn open_and_ping(client: &Client) -> Result<ConnectionManager> {
    let mut direct = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| FanoutError::redis("CONNECT", e))?;
    ping(&mut direct).await?;
    drop(direct);

    let mut conn = ConnectionManager::new(client.clone())
        .await
        .map_err(|e| FanoutError::redis("CONNECT", e))?;
    ping(&mut conn).await?;
    Ok(conn)
}

/// `PING` round-trip; anything but `PONG` is an error.
pub async fn ping<C: redis::aio::ConnectionLike>(conn: &mut C) -> Result<()> {
    let reply: String = redis::cmd("PING")
        .query_async(conn)
        .await
        .map_err(|e| FanoutError::redis("PING", e))?;
    if reply != "PONG" {
        return Err(FanoutError::redis_msg(
            "PING",
            format!("unexpected reply: {}", reply),
        ));
    }
    Ok(())
}

/// Create `group` on `stream` (and the stream itself) if absent.
///
/// Returns `true` if the group was created, `false` if it already existed.
pub async fn create_group(conn: &mut ConnectionManager, stream: &str, group: &str) -> Result<bool> {
    let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
        Err(e) => Err(FanoutError::redis("XGROUP CREATE", e)),
    }
}

/// Key of the topic metadata hash.
pub fn topic_meta_key(topic: &str) -> String {
    format!("{}:meta", topic)
}

/// Create the topic's partition streams, consumer group and metadata if absent.
///
/// Idempotent. A partition count that differs from the one recorded by an
/// earlier deployment is only warned about; changing it remaps documents.
pub async fn ensure_topic(
    conn: &mut ConnectionManager,
    topic: &str,
    group: &str,
    partitions: u32,
) -> Result<()> {
    let mut created = 0usize;
    for partition in 0..partitions {
        if create_group(conn, &stream_key(topic, partition), group).await? {
            created += 1;
        }
    }

    let meta_key = topic_meta_key(topic);
    let _: bool = conn
        .hset_nx(&meta_key, "partitions", partitions)
        .await
        .map_err(|e| FanoutError::redis("HSETNX", e))?;
    let recorded: Option<u32> = conn
        .hget(&meta_key, "partitions")
        .await
        .map_err(|e| FanoutError::redis("HGET", e))?;

    if let Some(recorded) = recorded {
        if recorded != partitions {
            warn!(
                topic,
                recorded,
                configured = partitions,
                "Partition count differs from the topic metadata"
            );
        }
    }

    info!(topic, group, partitions, created, "Topic ensured");
    Ok(())
}

/// Join the consumer group, retrying on a fixed schedule up to the ceiling.
///
/// `register` runs after the group exists on every partition (the consumer
/// uses it to announce itself in the membership set).
pub async fn subscribe_with_retry<R, Fut>(
    conn: &ConnectionManager,
    topic: &str,
    group: &str,
    partitions: u32,
    retry: &RetryConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut register: R,
) -> Result<()>
where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    retry_fixed("subscribe", retry, shutdown_rx, |attempt| {
        let mut conn = conn.clone();
        let registration = register();
        async move {
            debug!(topic, group, attempt, "Joining consumer group");
            join_group(&mut conn, topic, group, partitions).await?;
            registration.await
        }
    })
    .await?;

    info!(topic, group, "Joined consumer group");
    Ok(())
}

/// Make sure the group exists on every partition stream.
pub async fn join_group(
    conn: &mut ConnectionManager,
    topic: &str,
    group: &str,
    partitions: u32,
) -> Result<()> {
    for partition in 0..partitions {
        create_group(conn, &stream_key(topic, partition), group).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast(max_attempts: usize) -> RetryConfig {
        RetryConfig::fixed(max_attempts, Duration::from_millis(5), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_retry_fixed_succeeds_after_failures() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let value = retry_fixed("test", &fast(5), &mut rx, move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(FanoutError::redis_msg("TEST", "refused"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fixed_stops_at_ceiling() {
        let (_tx, mut rx) = watch::channel(false);
        let result: Result<()> = retry_fixed("subscribe", &fast(4), &mut rx, |_| async {
            Err(FanoutError::redis_msg("XGROUP", "refused"))
        })
        .await;

        match result {
            Err(FanoutError::BrokerUnreachable {
                operation,
                attempts,
                message,
            }) => {
                assert_eq!(operation, "subscribe");
                assert_eq!(attempts, 4);
                assert!(message.contains("refused"));
            }
            other => panic!("expected BrokerUnreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_fixed_times_out_attempts() {
        let (_tx, mut rx) = watch::channel(false);
        let retry = RetryConfig::fixed(2, Duration::from_millis(1), Duration::from_millis(20));
        let result: Result<()> = retry_fixed("slow", &retry, &mut rx, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(FanoutError::BrokerUnreachable { message, .. }) => {
                assert!(message.contains("timed out"));
            }
            other => panic!("expected BrokerUnreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_fixed_unbounded_until_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let retry = RetryConfig::fixed(usize::MAX, Duration::from_millis(5), Duration::from_millis(50));
        let task = tokio::spawn(async move {
            retry_fixed::<(), _, _>("connect", &retry, &mut rx, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(FanoutError::redis_msg("PING", "refused")) }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("retry loop should observe shutdown")
            .unwrap();
        assert!(matches!(result, Err(FanoutError::ShuttingDown)));
        assert!(calls.load(Ordering::SeqCst) > 1, "should keep retrying past one attempt");
    }

    #[tokio::test]
    async fn test_retry_fixed_shutdown_interrupts_attempt() {
        let (tx, mut rx) = watch::channel(false);
        let retry = RetryConfig::fixed(usize::MAX, Duration::from_millis(5), Duration::from_secs(30));

        let task = tokio::spawn(async move {
            retry_fixed::<(), _, _>("connect", &retry, &mut rx, |_| async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);

        let result = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("shutdown must cut a hanging attempt short")
            .unwrap();
        assert!(matches!(result, Err(FanoutError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_connect_refused_fails_fast() {
        let client = Client::open("redis://127.0.0.1:1").unwrap();
        let started = std::time::Instant::now();
        let result = timeout(Duration::from_secs(5), open_and_ping(&client))
            .await
            .expect("refused connect must not run a backoff loop");
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_with_retry_observes_shutdown_within_interval() {
        let (tx, mut rx) = watch::channel(false);
        let retry = RetryConfig::fixed(usize::MAX, Duration::from_millis(100), Duration::from_secs(10));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
        });

        let started = std::time::Instant::now();
        let result = connect_with_retry("test", "redis://127.0.0.1:1", &retry, &mut rx).await;
        assert!(matches!(result, Err(FanoutError::ShuttingDown)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_fixed_shutdown_before_first_attempt() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        let result: Result<()> = retry_fixed("connect", &fast(3), &mut rx, |_| async {
            Err(FanoutError::Internal("must not be called".to_string()))
        })
        .await;
        assert!(matches!(result, Err(FanoutError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_connect_with_retry_invalid_url() {
        let (_tx, mut rx) = watch::channel(false);
        let result = connect_with_retry("test", "not a url", &fast(1), &mut rx).await;
        assert!(matches!(result, Err(FanoutError::Config(_))));
    }

    #[test]
    fn test_topic_meta_key() {
        assert_eq!(topic_meta_key("document-updates"), "document-updates:meta");
    }
}
